//! Opaque host objects.
//!
//! The runtime never looks inside a reference: it stores it, hands it back
//! to built-in functions, prints it via [`Reference::describe`], and frees
//! it when the reference table drops the last handle. Host code downcasts
//! through [`Reference::as_any`] to recover the concrete type.

use std::any::Any;
use std::fmt::Debug;
use std::rc::Rc;

pub trait Reference: Debug {
    /// A short, human-readable rendering used by the pretty-printer.
    fn describe(&self) -> String;

    /// Downcasting support for typed argument fetchers.
    fn as_any(&self) -> &dyn Any;
}

/// Equality of references is identity of the shared handle.
pub fn same_reference(a: &Rc<dyn Reference>, b: &Rc<dyn Reference>) -> bool {
    Rc::ptr_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Marker(&'static str);

    impl Reference for Marker {
        fn describe(&self) -> String {
            self.0.to_string()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn references_compare_by_identity() {
        let a: Rc<dyn Reference> = Rc::new(Marker("a"));
        let b: Rc<dyn Reference> = Rc::new(Marker("a"));
        let a2 = Rc::clone(&a);
        assert!(same_reference(&a, &a2));
        assert!(!same_reference(&a, &b));
    }

    #[test]
    fn downcasting_recovers_the_concrete_type() {
        let a: Rc<dyn Reference> = Rc::new(Marker("hello"));
        let marker = a.as_any().downcast_ref::<Marker>().expect("should downcast");
        assert_eq!(marker.0, "hello");
    }
}
