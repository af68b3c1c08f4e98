//! Binder port - wire 上のバイト列とタスク引数の相互変換

use std::any::type_name;

use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::forward_to_deserialize_any;
use serde_json::{Map, Value};

use crate::domain::{Message, Publishing, Signature, TaskId, WorqError};

pub trait Binder: Send + Sync {
    /// Decode the body of `message` into positional and keyword arguments.
    ///
    /// Dispatches on content type; unknown types fail with
    /// `WorqError::UnsupportedContentType`.
    fn bind(&self, message: &Message) -> Result<BoundArgs, WorqError>;

    /// Encode `signature` into a publishing for `queue` carrying `id`.
    fn unbind(
        &self,
        id: &TaskId,
        queue: &str,
        signature: &Signature,
    ) -> Result<Publishing, WorqError>;
}

/// Arguments recovered from a message body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    pub positional: Vec<Value>,
    pub named: Map<String, Value>,
}

impl BoundArgs {
    pub fn new(positional: Vec<Value>, named: Map<String, Value>) -> Self {
        Self { positional, named }
    }

    /// Deserialize into `T`.
    ///
    /// For a struct, positional args fill its fields in declaration order and
    /// keyword args are then applied by name on top. Any other `T` is built
    /// from the positional args as a sequence, or from the keyword args when
    /// there are no positional ones.
    pub fn deserialize<T>(self) -> Result<T, WorqError>
    where
        T: DeserializeOwned,
    {
        if let Some(fields) = struct_fields::<T>() {
            if self.positional.len() > fields.len() {
                return Err(WorqError::InvalidArgument(format!(
                    "Bind({} positional args into {} fields of {})",
                    self.positional.len(),
                    fields.len(),
                    type_name::<T>()
                )));
            }
            let mut object: Map<String, Value> = fields
                .iter()
                .map(|field| field.to_string())
                .zip(self.positional)
                .collect();
            object.extend(self.named);
            return Ok(serde_json::from_value(Value::Object(object))?);
        }

        if self.positional.is_empty() {
            return Ok(serde_json::from_value(Value::Object(self.named))?);
        }
        if !self.named.is_empty() {
            return Err(WorqError::InvalidArgument(format!(
                "Bind(keyword args into non-struct {})",
                type_name::<T>()
            )));
        }
        Ok(serde_json::from_value(Value::Array(self.positional))?)
    }
}

/// Field names of `T` if it deserializes as a struct.
fn struct_fields<T: DeserializeOwned>() -> Option<&'static [&'static str]> {
    let mut fields = None;
    let _ = T::deserialize(FieldNames(&mut fields));
    fields
}

/// Deserializer that fails on every input, recording the field list a
/// derived struct asks for on the way.
struct FieldNames<'a>(&'a mut Option<&'static [&'static str]>);

impl<'de> Deserializer<'de> for FieldNames<'_> {
    type Error = de::value::Error;

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Self::Error> {
        Err(de::Error::custom("not a struct"))
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Self::Error> {
        *self.0 = Some(fields);
        Err(de::Error::custom("field names captured"))
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map enum identifier ignored_any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Add {
        x: i64,
        y: i64,
    }

    fn named(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn positional_args_follow_field_order() {
        let args = BoundArgs::new(vec![json!(2), json!(10)], Map::new());
        assert_eq!(args.deserialize::<Add>().unwrap(), Add { x: 2, y: 10 });
    }

    #[test]
    fn keyword_args_fill_by_name() {
        let args = BoundArgs::new(vec![], named(json!({"y": 10, "x": 2})));
        assert_eq!(args.deserialize::<Add>().unwrap(), Add { x: 2, y: 10 });
    }

    #[test]
    fn keyword_args_override_positional() {
        let args = BoundArgs::new(vec![json!(2), json!(10)], named(json!({"y": 7})));
        assert_eq!(args.deserialize::<Add>().unwrap(), Add { x: 2, y: 7 });
    }

    #[test]
    fn keyword_args_into_scalar_are_rejected() {
        let args = BoundArgs::new(vec![json!(5)], named(json!({"y": 7})));
        let err = args.deserialize::<(i64,)>().unwrap_err();
        assert!(matches!(err, WorqError::InvalidArgument(_)));
    }

    #[test]
    fn partial_positional_completed_by_keywords() {
        let args = BoundArgs::new(vec![json!(2)], named(json!({"y": 10})));
        assert_eq!(args.deserialize::<Add>().unwrap(), Add { x: 2, y: 10 });
    }

    #[test]
    fn too_many_positional_args_are_rejected() {
        let args = BoundArgs::new(vec![json!(1), json!(2), json!(3)], Map::new());
        let err = args.deserialize::<Add>().unwrap_err();
        assert!(matches!(err, WorqError::InvalidArgument(_)));
    }

    #[test]
    fn tuples_bind_from_positional_args() {
        let args = BoundArgs::new(vec![json!(2), json!("x")], Map::new());
        assert_eq!(args.deserialize::<(i64, String)>().unwrap(), (2, "x".to_string()));
    }

    #[test]
    fn wrong_arity_is_a_decode_error() {
        let args = BoundArgs::new(vec![json!(2)], Map::new());
        let err = args.deserialize::<Add>().unwrap_err();
        assert!(matches!(err, WorqError::Decode(_)));
    }
}
