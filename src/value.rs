use crate::heap::ObjRef;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Boolean(bool),
    Null,
    Obj(ObjRef),
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Boolean(false) | Value::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(num) => Some(*num),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(obj) => Some(*obj),
            _ => None,
        }
    }

    /// The number as an integer, if it has no fractional part.
    pub fn as_integer(&self) -> Option<i64> {
        self.as_number().and_then(whole)
    }
}

pub(crate) fn whole(num: f64) -> Option<i64> {
    (num.fract() == 0.0 && num.is_finite()).then_some(num as i64)
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<ObjRef> for Value {
    fn from(value: ObjRef) -> Self {
        Value::Obj(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falsiness() {
        assert!(Value::Null.is_falsey());
        assert!(Value::Boolean(false).is_falsey());
        assert!(!Value::Boolean(true).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
    }

    #[test]
    fn integers() {
        assert_eq!(Value::Number(3.0).as_integer(), Some(3));
        assert_eq!(Value::Number(-2.0).as_integer(), Some(-2));
        assert_eq!(Value::Number(1.5).as_integer(), None);
        assert_eq!(Value::Number(f64::INFINITY).as_integer(), None);
        assert_eq!(Value::Boolean(true).as_integer(), None);
    }
}
