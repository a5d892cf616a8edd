//! Resolution of fileset records into primitive layer stacks.

use sediment_common::{Error, FileSetId, Result};
use sediment_meta::{FileSetRecord, MetaStore, Primitive};

/// Resolves composite records into an ordered stack of primitive layers.
#[derive(Clone)]
pub struct Resolver {
    meta: MetaStore,
}

impl Resolver {
    pub fn new(meta: MetaStore) -> Self {
        Self { meta }
    }

    /// Flattens `id` into primitive layers, oldest first. Composites may
    /// nest; the relative order of leaves is preserved.
    pub fn flatten(&self, id: FileSetId) -> Result<Vec<Primitive>> {
        let mut out = Vec::new();
        self.flatten_into(id, &mut out, 0)?;
        Ok(out)
    }

    /// The single primitive behind `id`, failing on composites.
    pub fn primitive(&self, id: FileSetId) -> Result<Primitive> {
        match self.meta.get(id)? {
            FileSetRecord::Primitive(p) => Ok(p),
            FileSetRecord::Composite { .. } => Err(Error::NotPrimitive(id.to_string())),
        }
    }

    /// Whether `id` resolves to a single primitive layer.
    pub fn is_primitive(&self, id: FileSetId) -> Result<bool> {
        Ok(matches!(self.meta.get(id)?, FileSetRecord::Primitive(_)))
    }

    /// The IDs of the primitive leaves behind `id`, oldest first.
    pub fn leaf_ids(&self, id: FileSetId) -> Result<Vec<FileSetId>> {
        let mut out = Vec::new();
        self.leaf_ids_into(id, &mut out, 0)?;
        Ok(out)
    }

    fn leaf_ids_into(&self, id: FileSetId, out: &mut Vec<FileSetId>, depth: usize) -> Result<()> {
        if depth > MAX_COMPOSITE_DEPTH {
            return Err(Error::storage(format!(
                "composite nesting exceeds {MAX_COMPOSITE_DEPTH} resolving {id}"
            )));
        }
        match self.meta.get(id)? {
            FileSetRecord::Primitive(_) => out.push(id),
            FileSetRecord::Composite { layers } => {
                for layer in layers {
                    self.leaf_ids_into(layer, out, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn flatten_into(
        &self,
        id: FileSetId,
        out: &mut Vec<Primitive>,
        depth: usize,
    ) -> Result<()> {
        // A record cycle would only arise from store corruption, bound the
        // recursion instead of chasing it.
        if depth > MAX_COMPOSITE_DEPTH {
            return Err(Error::storage(format!(
                "composite nesting exceeds {MAX_COMPOSITE_DEPTH} resolving {id}"
            )));
        }
        match self.meta.get(id)? {
            FileSetRecord::Primitive(p) => out.push(p),
            FileSetRecord::Composite { layers } => {
                for layer in layers {
                    self.flatten_into(layer, out, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

const MAX_COMPOSITE_DEPTH: usize = 32;

#[cfg(test)]
mod tests {
    use sediment_meta::open;
    use tempfile::TempDir;

    use super::*;

    fn meta() -> (MetaStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(dir.path().join("meta.redb")).unwrap();
        (store, dir)
    }

    fn primitive(n: u8) -> Primitive {
        Primitive {
            additive: Vec::new(),
            deletive: vec![sediment_chunk::DataRef {
                chunk: sediment_common::content_hash(&[n]),
                offset: 0,
                length: u64::from(n),
                hash: None,
            }],
        }
    }

    #[test]
    fn test_flattens_nested_composites() {
        let (store, _dir) = meta();
        let resolver = Resolver::new(store.clone());

        let a = FileSetId::new();
        let b = FileSetId::new();
        let c = FileSetId::new();
        store
            .create(a, &FileSetRecord::Primitive(primitive(1)))
            .unwrap();
        store
            .create(b, &FileSetRecord::Primitive(primitive(2)))
            .unwrap();
        let inner = FileSetId::new();
        store
            .create(inner, &FileSetRecord::Composite { layers: vec![a, b] })
            .unwrap();
        store
            .create(c, &FileSetRecord::Primitive(primitive(3)))
            .unwrap();
        let outer = FileSetId::new();
        store
            .create(
                outer,
                &FileSetRecord::Composite {
                    layers: vec![inner, c],
                },
            )
            .unwrap();

        let layers = resolver.flatten(outer).unwrap();
        assert_eq!(layers, vec![primitive(1), primitive(2), primitive(3)]);
        assert_eq!(resolver.leaf_ids(outer).unwrap(), vec![a, b, c]);
        assert!(!resolver.is_primitive(outer).unwrap());
        assert!(resolver.is_primitive(a).unwrap());
    }

    #[test]
    fn test_primitive_rejects_composite() {
        let (store, _dir) = meta();
        let resolver = Resolver::new(store.clone());
        let a = FileSetId::new();
        store
            .create(a, &FileSetRecord::Primitive(primitive(1)))
            .unwrap();
        let comp = FileSetId::new();
        store
            .create(comp, &FileSetRecord::Composite { layers: vec![a] })
            .unwrap();
        let err = resolver.primitive(comp).unwrap_err();
        assert!(matches!(err, Error::NotPrimitive(_)));
        assert_eq!(resolver.primitive(a).unwrap(), primitive(1));
    }

    #[test]
    fn test_missing_record_surfaces_not_found() {
        let (store, _dir) = meta();
        let resolver = Resolver::new(store);
        let err = resolver.flatten(FileSetId::new()).unwrap_err();
        assert!(err.is_not_found());
    }
}
