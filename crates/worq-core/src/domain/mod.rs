//! Domain モデル（ID, Message, Signature, Decision, エラー）

pub mod decision;
pub mod errors;
pub mod ids;
pub mod message;
pub mod signature;

pub use self::decision::Decision;
pub use self::errors::{ErrorKind, WorqError};
pub use self::ids::{DeliveryTag, TaskId};
pub use self::message::{Headers, Message};
pub use self::signature::{AsyncResult, Publishing, Signature};
