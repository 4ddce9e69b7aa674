use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::error::TaskletError;

/// Dynamically typed value passed between tasklets.
#[derive(Clone)]
pub struct Value(Arc<dyn Any + Send + Sync>);

impl Value {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn unit() -> Self {
        Self::new(())
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Clones the payload out if it has type `T`.
    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(v) = self.downcast_ref::<i64>() {
            write!(f, "Value({v})")
        } else if let Some(v) = self.downcast_ref::<i32>() {
            write!(f, "Value({v})")
        } else if let Some(v) = self.downcast_ref::<String>() {
            write!(f, "Value({v:?})")
        } else if let Some(v) = self.downcast_ref::<&'static str>() {
            write!(f, "Value({v:?})")
        } else if self.is::<()>() {
            f.write_str("Value(())")
        } else {
            f.write_str("Value(..)")
        }
    }
}

/// Positional and keyword arguments for a tasklet body.
#[derive(Debug, Clone, Default)]
pub struct Args {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg<T: Any + Send + Sync>(self, value: T) -> Self {
        self.push(Value::new(value))
    }

    pub fn push(mut self, value: Value) -> Self {
        self.positional.push(value);
        self
    }

    pub fn kwarg<T: Any + Send + Sync>(mut self, name: impl Into<String>, value: T) -> Self {
        self.keyword.insert(name.into(), Value::new(value));
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keywords(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.keyword.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a tasklet finds in its mailbox when it resumes.
#[derive(Debug)]
pub(crate) enum Payload {
    Value(Value),
    Error(TaskletError),
}

impl Payload {
    pub(crate) fn into_result(self) -> Result<Value, TaskletError> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Error(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_downcast_to_their_type() {
        let value = Value::new(42_i64);
        assert!(value.is::<i64>());
        assert!(!value.is::<i32>());
        assert_eq!(value.get::<i64>(), Some(42));
        assert_eq!(format!("{value:?}"), "Value(42)");
    }

    #[test]
    fn clones_share_the_payload() {
        let value = Value::new(String::from("ping"));
        let copy = value.clone();
        assert!(value.ptr_eq(&copy));
        assert!(!value.ptr_eq(&Value::new(String::from("ping"))));
    }

    #[test]
    fn args_keep_positional_order_and_keywords() {
        let args = Args::new().arg(1_i32).arg("two").kwarg("three", 3_u8);
        assert_eq!(args.len(), 3);
        assert_eq!(args.get(0).and_then(Value::get::<i32>), Some(1));
        assert_eq!(args.get(1).and_then(Value::get::<&str>), Some("two"));
        assert_eq!(args.keyword("three").and_then(Value::get::<u8>), Some(3));
        assert!(args.keyword("four").is_none());
        assert!(Args::new().is_empty());
    }
}
