//! Kernel map handles.
//!
//! A [`Map`] owns the file descriptor of a created map and closes it on
//! drop. Data plane access is generic over [`Pod`] keys and values.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;

use libc::{close, ENOENT};
use thiserror::Error;

use crate::features::FEATURES;
use crate::obj::MapSpec;
use crate::sys::{
    bpf_create_map, bpf_map_create_attr, bpf_map_delete_elem, bpf_map_get_next_key,
    bpf_map_lookup_elem, bpf_map_update_elem, bpf_pin_object, new_obj_name, NameError, PinError,
};
use crate::Pod;

/// The error type returned when working with a [`Map`].
#[derive(Debug, Error)]
pub enum MapError {
    #[error("invalid map name")]
    InvalidName(#[from] NameError),

    #[error("map `{name}` needs an inner map specification")]
    MissingInnerMap { name: String },

    #[error("failed to create map `{name}`: {code}")]
    CreateFailed {
        name: String,
        code: i64,
        #[source]
        io_error: io::Error,
    },

    #[error("invalid key size {size}, expected {expected}")]
    InvalidKeySize { size: usize, expected: usize },

    #[error("invalid value size {size}, expected {expected}")]
    InvalidValueSize { size: usize, expected: usize },

    #[error("the BPF_MAP_LOOKUP_ELEM syscall failed with code {code}")]
    LookupFailed {
        code: i64,
        #[source]
        io_error: io::Error,
    },

    #[error("the BPF_MAP_UPDATE_ELEM syscall failed with code {code}")]
    UpdateFailed {
        code: i64,
        #[source]
        io_error: io::Error,
    },

    #[error("the BPF_MAP_DELETE_ELEM syscall failed with code {code}")]
    DeleteFailed {
        code: i64,
        #[source]
        io_error: io::Error,
    },

    #[error("the BPF_MAP_GET_NEXT_KEY syscall failed with code {code}")]
    GetNextKeyFailed {
        code: i64,
        #[source]
        io_error: io::Error,
    },

    #[error("error pinning map")]
    Pin(#[from] PinError),
}

/// A created map. Owns the map's file descriptor.
#[derive(Debug)]
pub struct Map {
    name: String,
    spec: MapSpec,
    fd: RawFd,
}

impl Map {
    /// Creates the map described by `spec`.
    ///
    /// For map-of-maps types a template inner map is created first and its
    /// file descriptor passed along; the template is closed again once the
    /// outer map exists.
    pub fn create(name: &str, spec: &MapSpec) -> Result<Map, MapError> {
        let inner = match &spec.inner_map {
            Some(inner_spec) => Some(Map::create("", inner_spec)?),
            None if spec.map_type.is_map_of_maps() => {
                return Err(MapError::MissingInnerMap {
                    name: name.to_string(),
                })
            }
            None => None,
        };

        // the kernel wants fd-valued maps to have 4 byte values, which the
        // map section of an object file usually leaves at 0
        let value_size = match (spec.map_type.is_map_of_maps(), spec.value_size) {
            (true, 0) => mem::size_of::<u32>() as u32,
            (_, size) => size,
        };

        let obj_name = new_obj_name(name)?;
        let mut attr = bpf_map_create_attr {
            map_type: spec.map_type as u32,
            key_size: spec.key_size,
            value_size,
            max_entries: spec.max_entries,
            map_flags: spec.flags,
            inner_map_fd: inner.as_ref().map(|m| m.fd as u32).unwrap_or(0),
            ..Default::default()
        };
        if FEATURES.obj_name {
            attr.map_name = obj_name;
        }

        let fd = bpf_create_map(&attr).map_err(|(code, io_error)| MapError::CreateFailed {
            name: name.to_string(),
            code,
            io_error,
        })? as RawFd;

        Ok(Map {
            name: name.to_string(),
            spec: spec.clone(),
            fd,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns the value stored under `key`, or `None` if there is none.
    pub fn lookup<K: Pod, V: Pod>(&self, key: &K) -> Result<Option<V>, MapError> {
        self.check_key_size::<K>()?;
        self.check_value_size::<V>()?;

        let mut value = mem::MaybeUninit::<V>::uninit();
        match bpf_map_lookup_elem(self.fd, key as *const K as u64, value.as_mut_ptr() as u64) {
            Ok(_) => Ok(Some(unsafe { value.assume_init() })),
            Err((_, io_error)) if io_error.raw_os_error() == Some(ENOENT) => Ok(None),
            Err((code, io_error)) => Err(MapError::LookupFailed { code, io_error }),
        }
    }

    pub fn update<K: Pod, V: Pod>(&self, key: &K, value: &V, flags: u64) -> Result<(), MapError> {
        self.check_key_size::<K>()?;
        self.check_value_size::<V>()?;

        bpf_map_update_elem(
            self.fd,
            key as *const K as u64,
            value as *const V as u64,
            flags,
        )
        .map(|_| ())
        .map_err(|(code, io_error)| MapError::UpdateFailed { code, io_error })
    }

    pub fn delete<K: Pod>(&self, key: &K) -> Result<(), MapError> {
        self.check_key_size::<K>()?;

        bpf_map_delete_elem(self.fd, key as *const K as u64)
            .map(|_| ())
            .map_err(|(code, io_error)| MapError::DeleteFailed { code, io_error })
    }

    /// Returns the key following `key`, or the first key when `key` is
    /// `None`. Returns `None` once the last key has been reached.
    pub fn next_key<K: Pod>(&self, key: Option<&K>) -> Result<Option<K>, MapError> {
        self.check_key_size::<K>()?;

        let mut next = mem::MaybeUninit::<K>::uninit();
        let key = key.map(|k| k as *const K as u64).unwrap_or(0);
        match bpf_map_get_next_key(self.fd, key, next.as_mut_ptr() as u64) {
            Ok(_) => Ok(Some(unsafe { next.assume_init() })),
            Err((_, io_error)) if io_error.raw_os_error() == Some(ENOENT) => Ok(None),
            Err((code, io_error)) => Err(MapError::GetNextKeyFailed { code, io_error }),
        }
    }

    /// Pins the map, keeping it alive past the lifetime of this process.
    /// `path` must be on a bpf filesystem.
    pub fn pin<P: AsRef<Path>>(&self, path: P) -> Result<(), MapError> {
        Ok(bpf_pin_object(path.as_ref(), self.fd)?)
    }

    fn check_key_size<K>(&self) -> Result<(), MapError> {
        let size = mem::size_of::<K>();
        if size != self.spec.key_size as usize {
            return Err(MapError::InvalidKeySize {
                size,
                expected: self.spec.key_size as usize,
            });
        }
        Ok(())
    }

    fn check_value_size<V>(&self) -> Result<(), MapError> {
        let size = mem::size_of::<V>();
        if size != self.spec.value_size as usize {
            return Err(MapError::InvalidValueSize {
                size,
                expected: self.spec.value_size as usize,
            });
        }
        Ok(())
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        unsafe { close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use assert_matches::assert_matches;
    use libc::EFAULT;

    use super::*;
    use crate::obj::MapType;
    use crate::sys::{override_syscall, Syscall, BPF_MAP_LOOKUP_ELEM};

    fn hash_spec() -> MapSpec {
        MapSpec {
            map_type: MapType::Hash,
            key_size: 4,
            value_size: 4,
            max_entries: 1024,
            flags: 0,
            inner_map: None,
        }
    }

    #[test]
    fn test_create() {
        override_syscall(|call| match call {
            Syscall::MapCreate { .. } => Ok(4242),
            _ => Err((-1, io::Error::from_raw_os_error(EFAULT))),
        });

        let map = Map::create("foo", &hash_spec()).unwrap();
        assert_eq!(map.fd(), 4242);
        assert_eq!(map.name(), "foo");
    }

    #[test]
    fn test_create_failed() {
        override_syscall(|_| Err((-42, io::Error::from_raw_os_error(EFAULT))));

        let result = Map::create("foo", &hash_spec());
        assert_matches!(
            result,
            Err(MapError::CreateFailed { name, code: -42, .. }) if name == "foo"
        );
    }

    #[test]
    fn test_create_invalid_name() {
        assert_matches!(
            Map::create("foo bar", &hash_spec()),
            Err(MapError::InvalidName(NameError::InvalidCharacter { ch: ' ', .. }))
        );
    }

    #[test]
    fn test_create_map_of_maps() {
        let created = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&created);
        override_syscall(move |call| match call {
            Syscall::MapCreate { attr } => {
                let mut log = log.borrow_mut();
                log.push((attr.map_type, attr.inner_map_fd));
                Ok(5000 + log.len() as i64)
            }
            _ => Err((-1, io::Error::from_raw_os_error(EFAULT))),
        });

        let spec = MapSpec {
            map_type: MapType::ArrayOfMaps,
            key_size: 4,
            value_size: 0,
            max_entries: 2,
            flags: 0,
            inner_map: Some(Box::new(hash_spec())),
        };
        let map = Map::create("outer", &spec).unwrap();

        let created = created.borrow();
        // the inner template is created first, then passed to the outer
        // create and closed again
        let creates: Vec<_> = created
            .iter()
            .filter(|(ty, _)| *ty != MapType::Array as u32) // ignore the feature probe
            .collect();
        assert_eq!(creates.len(), 2);
        assert_eq!(creates[0].0, MapType::Hash as u32);
        let inner_fd = 5000 + created
            .iter()
            .position(|(ty, _)| *ty == MapType::Hash as u32)
            .unwrap() as u32
            + 1;
        assert_eq!(creates[1].0, MapType::ArrayOfMaps as u32);
        assert_eq!(creates[1].1, inner_fd);
        assert!(map.fd() > 5000);
    }

    #[test]
    fn test_map_of_maps_missing_inner() {
        let spec = MapSpec {
            map_type: MapType::HashOfMaps,
            key_size: 4,
            value_size: 0,
            max_entries: 2,
            flags: 0,
            inner_map: None,
        };
        assert_matches!(
            Map::create("outer", &spec),
            Err(MapError::MissingInnerMap { name }) if name == "outer"
        );
    }

    fn fake_map() -> Map {
        Map {
            name: "foo".to_string(),
            spec: hash_spec(),
            fd: 4242,
        }
    }

    #[test]
    fn test_lookup_not_found() {
        override_syscall(|call| match call {
            Syscall::MapElem {
                cmd: BPF_MAP_LOOKUP_ELEM,
                ..
            } => Err((-1, io::Error::from_raw_os_error(ENOENT))),
            _ => Err((-1, io::Error::from_raw_os_error(EFAULT))),
        });

        let map = fake_map();
        let value: Option<u32> = map.lookup(&1u32).unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_update() {
        override_syscall(|call| match call {
            Syscall::MapElem { .. } => Ok(0),
            _ => Err((-1, io::Error::from_raw_os_error(EFAULT))),
        });

        let map = fake_map();
        map.update(&1u32, &2u32, 0).unwrap();
    }

    #[test]
    fn test_invalid_key_size() {
        let map = fake_map();
        assert_matches!(
            map.delete(&1u64),
            Err(MapError::InvalidKeySize {
                size: 8,
                expected: 4
            })
        );
    }
}
