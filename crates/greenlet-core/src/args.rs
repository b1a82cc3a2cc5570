//! Switch payloads

use crate::error::Failure;
use crate::object::ObjectKind;
use crate::refs::{AnyObject, Borrowed, Object, Owned};

/// What crosses a switch: arguments on success, a failure otherwise
pub type Payload = Result<Args, Failure>;

/// Positional and keyword arguments, each an owned object reference
#[derive(Debug, Clone, Default)]
pub struct Args {
    positional: Vec<Object>,
    keywords: Vec<(String, Object)>,
}

impl Args {
    pub fn new() -> Self {
        Args::default()
    }

    /// Append a positional argument holding `value`
    pub fn arg<T: ObjectKind>(self, value: T) -> Self {
        self.arg_object(Owned::new(value).into_any())
    }

    pub fn arg_object(mut self, obj: Object) -> Self {
        self.positional.push(obj);
        self
    }

    /// Set keyword `name`, replacing an earlier value for the same name
    pub fn kwarg<T: ObjectKind>(self, name: impl Into<String>, value: T) -> Self {
        self.kwarg_object(name, Owned::new(value).into_any())
    }

    pub fn kwarg_object(mut self, name: impl Into<String>, obj: Object) -> Self {
        let name = name.into();
        match self.keywords.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = obj,
            None => self.keywords.push((name, obj)),
        }
        self
    }

    /// Total number of arguments, positional and keyword
    pub fn len(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn positional(&self) -> &[Object] {
        &self.positional
    }

    pub fn keywords(&self) -> &[(String, Object)] {
        &self.keywords
    }

    pub fn get(&self, index: usize) -> Option<Borrowed<'_, AnyObject>> {
        self.positional.get(index).map(Owned::borrow)
    }

    pub fn get_kwarg(&self, name: &str) -> Option<Borrowed<'_, AnyObject>> {
        self.keywords.iter().find(|(k, _)| k == name).map(|(_, v)| v.borrow())
    }

    /// Copy of positional `index` if it holds a `T`
    pub fn value<T: ObjectKind + Clone>(&self, index: usize) -> Option<T> {
        self.get(index)?.try_cast::<T>().map(|b| (*b).clone())
    }

    /// Copy of keyword `name` if it holds a `T`
    pub fn kwarg_value<T: ObjectKind + Clone>(&self, name: &str) -> Option<T> {
        self.get_kwarg(name)?.try_cast::<T>().map(|b| (*b).clone())
    }

    pub fn into_parts(self) -> (Vec<Object>, Vec<(String, Object)>) {
        (self.positional, self.keywords)
    }
}

impl From<Vec<Object>> for Args {
    fn from(positional: Vec<Object>) -> Self {
        Args { positional, keywords: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_getters() {
        let args = Args::new().arg(1i64).arg("two").kwarg("x", 3u32);
        assert_eq!(args.len(), 3);
        assert_eq!(args.value::<i64>(0), Some(1));
        assert_eq!(args.value::<&'static str>(1), Some("two"));
        assert_eq!(args.kwarg_value::<u32>("x"), Some(3));
        assert_eq!(args.value::<u32>(0), None);
        assert!(args.get(5).is_none());
        assert!(args.get_kwarg("y").is_none());
    }

    #[test]
    fn test_kwarg_replaces() {
        let args = Args::new().kwarg("k", 1i64).kwarg("k", 2i64);
        assert_eq!(args.keywords().len(), 1);
        assert_eq!(args.kwarg_value::<i64>("k"), Some(2));
    }

    #[test]
    fn test_clone_shares_objects() {
        let args = Args::new().arg(String::from("shared"));
        let copy = args.clone();
        assert_eq!(args.positional()[0].refcount(), 2);
        drop(copy);
        assert_eq!(args.positional()[0].refcount(), 1);
        assert!(Args::new().is_empty());
    }
}
