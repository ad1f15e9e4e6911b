//! Translation Registry: the bidirectional wrapper<->implementation map and
//! the recursive argument/return traversal built on top of it.
//!
//! Container traversal (tuple/list/dict/set/frozenset) dispatches by
//! explicit Python type check. Rust has no handle analogous to a weak Python
//! reference, so the "weak" half of the registry (`impl_to_wrapper`) is
//! implemented by reaching into Python's own `weakref.ref` rather than
//! inventing a GC-integrated Rust structure.

use ahash::RandomState;
use dashmap::DashMap;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyFrozenSet, PyList, PySet, PyTuple};
use std::sync::Arc;

/// Pointer identity of a Python object, used as the map key instead of
/// Python-level hashing/equality — translation is identity-based, not
/// value-based.
type ObjId = usize;

fn obj_id(obj: &Bound<'_, PyAny>) -> ObjId {
    obj.as_ptr() as usize
}

struct WeakWrapperEntry {
    weak_ref: Py<PyAny>,
    /// Id of the specific wrapper this entry was created for, so a
    /// finalizer for an older, already-replaced wrapper never removes a
    /// newer binding for the same implementation object.
    wrapper_id: ObjId,
}

impl WeakWrapperEntry {
    fn upgrade(&self, py: Python<'_>) -> Option<Py<PyAny>> {
        let referent = self.weak_ref.call0(py).ok()?;
        if referent.is_none(py) {
            None
        } else {
            Some(referent)
        }
    }
}

/// One Synchronizer's view of wrapper↔implementation identity.
///
/// - `impl_to_wrapper`: weak (via `weakref.ref`), keyed by implementation
///   object id.
/// - `wrapper_to_impl`: strong, keyed by wrapper object id; the wrapper owns
///   the implementation it forwards to.
/// - `type_map` / `type_map_rev`: implementation class id -> wrapper class,
///   and back, established once at wrap-time.
pub(crate) struct TranslationRegistry {
    impl_to_wrapper: DashMap<ObjId, WeakWrapperEntry, RandomState>,
    wrapper_to_impl: DashMap<ObjId, Py<PyAny>, RandomState>,
    type_map: DashMap<ObjId, Py<PyAny>, RandomState>,
    type_map_rev: DashMap<ObjId, Py<PyAny>, RandomState>,
}

impl Default for TranslationRegistry {
    fn default() -> Self {
        Self {
            impl_to_wrapper: DashMap::with_hasher(RandomState::new()),
            wrapper_to_impl: DashMap::with_hasher(RandomState::new()),
            type_map: DashMap::with_hasher(RandomState::new()),
            type_map_rev: DashMap::with_hasher(RandomState::new()),
        }
    }
}

impl TranslationRegistry {
    /// `register_wrapper(impl_cls) -> wrapper_cls`: idempotent. The actual
    /// wrapper-class construction is the Wrapper Factory's job; this just
    /// remembers the association once it has been made.
    pub(crate) fn wrapper_class_for(&self, impl_cls: &Bound<'_, PyAny>) -> Option<Py<PyAny>> {
        self.type_map.get(&obj_id(impl_cls)).map(|e| e.value().clone_ref(impl_cls.py()))
    }

    pub(crate) fn register_type_pair(&self, impl_cls: Py<PyAny>, wrapper_cls: Py<PyAny>, py: Python<'_>) {
        let impl_id = obj_id(impl_cls.bind(py));
        let wrapper_id = obj_id(wrapper_cls.bind(py));
        self.type_map.insert(impl_id, wrapper_cls.clone_ref(py));
        self.type_map_rev.insert(wrapper_id, impl_cls);
    }

    pub(crate) fn is_registered_impl_class(&self, cls: &Bound<'_, PyAny>) -> bool {
        self.type_map.contains_key(&obj_id(cls))
    }

    pub(crate) fn is_wrapper_class(&self, cls: &Bound<'_, PyAny>) -> bool {
        self.type_map_rev.contains_key(&obj_id(cls))
    }

    /// Fetch the live wrapper for `impl_obj`, if one is still reachable.
    pub(crate) fn existing_wrapper(&self, py: Python<'_>, impl_obj: &Bound<'_, PyAny>) -> Option<Py<PyAny>> {
        let id = obj_id(impl_obj);
        let entry = self.impl_to_wrapper.get(&id)?;
        let upgraded = entry.upgrade(py);
        if upgraded.is_none() {
            drop(entry);
            self.impl_to_wrapper.remove(&id);
        }
        upgraded
    }

    /// Record a freshly-created `(impl, wrapper)` pair. `wrapper` strongly
    /// owns `impl_obj`; `impl_obj` only weakly references `wrapper` back.
    ///
    /// Also registers a `weakref.finalize` on `wrapper_obj` that removes both
    /// entries once the wrapper is collected. Without it, `wrapper_to_impl`
    /// would hold `impl_obj` alive forever and, worse, keep mapping the
    /// wrapper's now-freed address to a stale implementation if CPython's
    /// allocator hands that address to an unrelated object next.
    pub(crate) fn bind(self: &Arc<Self>, py: Python<'_>, impl_obj: Py<PyAny>, wrapper_obj: Py<PyAny>) -> PyResult<()> {
        let weakref_mod = py.import("weakref")?;
        let weak_ref: Py<PyAny> = weakref_mod.call_method1("ref", (&wrapper_obj,))?.unbind();

        let impl_id = obj_id(impl_obj.bind(py));
        let wrapper_id = obj_id(wrapper_obj.bind(py));

        self.impl_to_wrapper.insert(impl_id, WeakWrapperEntry { weak_ref, wrapper_id });
        self.wrapper_to_impl.insert(wrapper_id, impl_obj);

        let finalizer = Py::new(
            py,
            WrapperCollected {
                registry: self.clone(),
                impl_id,
                wrapper_id,
            },
        )?;
        weakref_mod.call_method1("finalize", (&wrapper_obj, finalizer))?;
        Ok(())
    }

    pub(crate) fn implementation_of(&self, wrapper_obj: &Bound<'_, PyAny>) -> Option<Py<PyAny>> {
        self.wrapper_to_impl
            .get(&obj_id(wrapper_obj))
            .map(|e| e.value().clone_ref(wrapper_obj.py()))
    }

    /// `translate_in`: recursively replace wrappers with their
    /// implementations. Non-wrappers, including unrelated user objects that
    /// merely resemble one, pass through unchanged.
    pub(crate) fn translate_in(&self, py: Python<'_>, value: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
        if let Some(impl_obj) = self.implementation_of(value) {
            return Ok(impl_obj);
        }
        self.traverse(py, value)
    }

    /// `translate_out`: recursively replace implementation instances (of a
    /// registered class) with their wrapper, creating and caching one if
    /// none exists yet.
    pub(crate) fn translate_out(&self, py: Python<'_>, value: &Bound<'_, PyAny>, wrap_impl: &dyn Fn(Python<'_>, &Bound<'_, PyAny>) -> PyResult<Py<PyAny>>) -> PyResult<Py<PyAny>> {
        let cls = value.get_type();
        if self.is_registered_impl_class(&cls) {
            if let Some(existing) = self.existing_wrapper(py, value) {
                return Ok(existing);
            }
            return wrap_impl(py, value);
        }
        self.traverse_out(py, value, wrap_impl)
    }

    fn traverse(&self, py: Python<'_>, value: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
        if let Ok(tuple) = value.cast::<PyTuple>() {
            let mut items = Vec::with_capacity(tuple.len());
            for item in tuple.iter() {
                items.push(self.translate_in(py, &item)?);
            }
            return Ok(PyTuple::new(py, items)?.into_any().unbind());
        }
        if let Ok(list) = value.cast::<PyList>() {
            let out = PyList::empty(py);
            for item in list.iter() {
                out.append(self.translate_in(py, &item)?)?;
            }
            return Ok(out.into_any().unbind());
        }
        if let Ok(dict) = value.cast::<PyDict>() {
            let out = PyDict::new(py);
            for (k, v) in dict.iter() {
                out.set_item(self.translate_in(py, &k)?, self.translate_in(py, &v)?)?;
            }
            return Ok(out.into_any().unbind());
        }
        if let Ok(set) = value.cast::<PySet>() {
            let out = PySet::empty(py)?;
            for item in set.iter() {
                out.add(self.translate_in(py, &item)?)?;
            }
            return Ok(out.into_any().unbind());
        }
        if let Ok(fset) = value.cast::<PyFrozenSet>() {
            let mut items = Vec::with_capacity(fset.len());
            for item in fset.iter() {
                items.push(self.translate_in(py, &item)?);
            }
            return Ok(PyFrozenSet::new(py, &items)?.into_any().unbind());
        }
        Ok(value.clone().unbind())
    }

    fn traverse_out(&self, py: Python<'_>, value: &Bound<'_, PyAny>, wrap_impl: &dyn Fn(Python<'_>, &Bound<'_, PyAny>) -> PyResult<Py<PyAny>>) -> PyResult<Py<PyAny>> {
        if let Ok(tuple) = value.cast::<PyTuple>() {
            let mut items = Vec::with_capacity(tuple.len());
            for item in tuple.iter() {
                items.push(self.translate_out(py, &item, wrap_impl)?);
            }
            return Ok(PyTuple::new(py, items)?.into_any().unbind());
        }
        if let Ok(list) = value.cast::<PyList>() {
            let out = PyList::empty(py);
            for item in list.iter() {
                out.append(self.translate_out(py, &item, wrap_impl)?)?;
            }
            return Ok(out.into_any().unbind());
        }
        if let Ok(dict) = value.cast::<PyDict>() {
            let out = PyDict::new(py);
            for (k, v) in dict.iter() {
                out.set_item(
                    self.translate_out(py, &k, wrap_impl)?,
                    self.translate_out(py, &v, wrap_impl)?,
                )?;
            }
            return Ok(out.into_any().unbind());
        }
        if let Ok(set) = value.cast::<PySet>() {
            let out = PySet::empty(py)?;
            for item in set.iter() {
                out.add(self.translate_out(py, &item, wrap_impl)?)?;
            }
            return Ok(out.into_any().unbind());
        }
        if let Ok(fset) = value.cast::<PyFrozenSet>() {
            let mut items = Vec::with_capacity(fset.len());
            for item in fset.iter() {
                items.push(self.translate_out(py, &item, wrap_impl)?);
            }
            return Ok(PyFrozenSet::new(py, &items)?.into_any().unbind());
        }
        Ok(value.clone().unbind())
    }
}

/// `weakref.finalize` callback registered on every wrapper in `bind()`.
/// Mirrors `lifecycle::register_process_exit_finalizer`'s pattern of a
/// pyclass-as-callable held by the weakref module itself.
#[pyclass]
struct WrapperCollected {
    registry: Arc<TranslationRegistry>,
    impl_id: ObjId,
    wrapper_id: ObjId,
}

#[pymethods]
impl WrapperCollected {
    fn __call__(&self) {
        self.registry.wrapper_to_impl.remove(&self.wrapper_id);
        self.registry.impl_to_wrapper.remove_if(&self.impl_id, |_, entry| entry.wrapper_id == self.wrapper_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::types::PyString;

    #[test]
    fn translate_in_is_identity_for_plain_values() {
        Python::attach(|py| {
            let registry = TranslationRegistry::default();
            let s = PyString::new(py, "hello");
            let out = registry.translate_in(py, s.as_any()).unwrap();
            assert!(out.bind(py).eq(s).unwrap());
        });
    }

    #[test]
    fn translate_in_preserves_tuple_shape() {
        Python::attach(|py| {
            let registry = TranslationRegistry::default();
            let tuple = PyTuple::new(py, [1, 2, 3]).unwrap();
            let out = registry.translate_in(py, tuple.as_any()).unwrap();
            let out_tuple = out.bind(py).cast::<PyTuple>().unwrap();
            assert_eq!(out_tuple.len(), 3);
        });
    }

    #[test]
    fn bind_and_lookup_roundtrip() {
        Python::attach(|py| {
            let registry = Arc::new(TranslationRegistry::default());
            let impl_obj: Py<PyAny> = PyString::new(py, "impl").into_any().unbind();
            let wrapper_obj: Py<PyAny> = PyString::new(py, "wrapper").into_any().unbind();
            registry.bind(py, impl_obj.clone_ref(py), wrapper_obj.clone_ref(py)).unwrap();

            let found_impl = registry.implementation_of(wrapper_obj.bind(py));
            assert!(found_impl.is_some());

            let found_wrapper = registry.existing_wrapper(py, impl_obj.bind(py));
            assert!(found_wrapper.is_some());
        });
    }
}
