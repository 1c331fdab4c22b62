//! Application hook into the persistence lifecycle.

use crate::metadata::PropertyKind;
use crate::object::EntityHandle;
use crate::{Result, Value};

/// User-supplied callbacks consulted by the session.
///
/// Every method has a no-op default, so implementors override only what
/// they need.
pub trait Interceptor: Send + Sync {
    /// Called with the disassembled state of a freshly loaded instance,
    /// before it is populated. Return `true` if `state` was modified.
    fn on_load(
        &self,
        _entity: &EntityHandle,
        _id: &Value,
        _state: &mut [Value],
        _property_names: &[&str],
        _property_kinds: &[PropertyKind],
    ) -> Result<bool> {
        Ok(false)
    }

    /// Decide whether an unmanaged instance is transient. `None` defers to
    /// the unsaved-value strategy.
    fn is_transient(&self, _entity: &EntityHandle) -> Option<bool> {
        None
    }

    /// Called before an instance is scheduled for insertion.
    fn on_save(&self, _entity: &EntityHandle, _id: &Value) -> Result<()> {
        Ok(())
    }

    /// Called before an instance is scheduled for deletion.
    fn on_delete(&self, _entity: &EntityHandle, _id: &Value) -> Result<()> {
        Ok(())
    }
}

/// Interceptor that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInterceptor;

impl Interceptor for NoopInterceptor {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::EntityMetadata;

    struct Uppercase;

    impl Interceptor for Uppercase {
        fn on_load(
            &self,
            _entity: &EntityHandle,
            _id: &Value,
            state: &mut [Value],
            _property_names: &[&str],
            _property_kinds: &[PropertyKind],
        ) -> Result<bool> {
            let mut changed = false;
            for value in state.iter_mut() {
                if let Value::Text(s) = value {
                    *s = s.to_uppercase();
                    changed = true;
                }
            }
            Ok(changed)
        }
    }

    #[test]
    fn test_noop_defaults() {
        let meta = EntityMetadata::new("Tag").build().unwrap();
        let tag = EntityHandle::with_id(&meta, "rust");
        let mut state = vec![Value::from("x")];
        assert!(!NoopInterceptor.on_load(&tag, &tag.id(), &mut state, &[], &[]).unwrap());
        assert_eq!(NoopInterceptor.is_transient(&tag), None);
    }

    #[test]
    fn test_on_load_can_rewrite_state() {
        let meta = EntityMetadata::new("Tag").build().unwrap();
        let tag = EntityHandle::with_id(&meta, "rust");
        let mut state = vec![Value::from("crab"), Value::Int(1)];
        assert!(Uppercase.on_load(&tag, &tag.id(), &mut state, &[], &[]).unwrap());
        assert_eq!(state[0], Value::from("CRAB"));
    }
}
