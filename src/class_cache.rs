//! Per-class instance field layouts, computed once per class per worker.

use crate::introspect::HeapIntrospector;
use crate::{FieldType, Id, IdSize};
use getset::{CopyGetters, Getters};
use std::collections;
use std::rc::Rc;

/// Once more classes than this are cached, the whole cache is dropped and rebuilt on demand.
pub const CACHE_TOP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedField {
    pub field_type: FieldType,
    pub offset: u32,
}

/// Every instance field of a class, the class's own fields first, then its super class's, etc.
#[derive(Debug, Getters, CopyGetters)]
pub struct ClassLayout {
    #[get = "pub"]
    fields: Vec<CachedField>,
    /// Sum of the encoded field sizes, i.e. the byte count of an instance dump's field values
    #[get_copy = "pub"]
    instance_size: u32,
}

impl ClassLayout {
    fn compute<H: HeapIntrospector + ?Sized>(
        heap: &H,
        class: Id,
        id_size: IdSize,
    ) -> Option<ClassLayout> {
        let mut fields = Vec::new();
        let mut instance_size = 0_u32;

        let mut next = Some(class);
        while let Some(class_id) = next {
            let info = heap.class(class_id)?;
            for field in info.fields.iter().filter(|f| !f.is_static) {
                let field_type = match field.field_type() {
                    Some(t) => t,
                    None => {
                        log::warn!(
                            "Skipping field with unknown signature {:#X} in class {:#X}",
                            field.signature,
                            class_id
                        );
                        continue;
                    }
                };
                instance_size += field_type.size_in_bytes(id_size) as u32;
                fields.push(CachedField {
                    field_type,
                    offset: field.offset,
                });
            }
            next = info.super_class;
        }

        Some(ClassLayout {
            fields,
            instance_size,
        })
    }
}

pub struct ClassMetadataCache {
    id_size: IdSize,
    entries: collections::HashMap<Id, Rc<ClassLayout>>,
    /// Consecutive objects are often of the same class
    last: Option<(Id, Rc<ClassLayout>)>,
}

impl ClassMetadataCache {
    pub fn new(id_size: IdSize) -> ClassMetadataCache {
        ClassMetadataCache {
            id_size,
            entries: collections::HashMap::new(),
            last: None,
        }
    }

    /// None if the introspector doesn't know `class` or one of its super classes.
    pub fn lookup_or_create<H: HeapIntrospector + ?Sized>(
        &mut self,
        heap: &H,
        class: Id,
    ) -> Option<Rc<ClassLayout>> {
        if let Some((last_id, layout)) = &self.last {
            if *last_id == class {
                return Some(Rc::clone(layout));
            }
        }

        let layout = match self.entries.get(&class) {
            Some(layout) => Rc::clone(layout),
            None => {
                let layout = Rc::new(ClassLayout::compute(heap, class, self.id_size)?);
                if self.entries.len() >= CACHE_TOP {
                    self.entries.clear();
                }
                self.entries.insert(class, Rc::clone(&layout));
                layout
            }
        };

        self.last = Some((class, Rc::clone(&layout)));
        Some(layout)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_heap::{FieldSpec, InMemoryHeap};

    #[test]
    fn layout_lists_own_fields_before_inherited_ones() {
        let mut heap = InMemoryHeap::new(IdSize::U64);
        let object = heap.object_class();
        let base = heap.define_class(
            "Base",
            Some(object),
            &[FieldSpec::instance("parent", "Ljava/lang/Object;"), FieldSpec::instance("flag", "Z")],
        );
        let derived = heap.define_class(
            "Derived",
            Some(base),
            &[
                FieldSpec::instance("count", "J"),
                FieldSpec::static_field("INSTANCES", "I"),
            ],
        );

        let mut cache = ClassMetadataCache::new(IdSize::U64);
        let layout = cache.lookup_or_create(&heap, derived).unwrap();

        assert_eq!(
            vec![FieldType::Long, FieldType::Object, FieldType::Boolean],
            layout.fields().iter().map(|f| f.field_type).collect::<Vec<_>>()
        );
        assert_eq!(8 + 8 + 1, layout.instance_size());
    }

    #[test]
    fn repeated_lookups_share_one_layout() {
        let mut heap = InMemoryHeap::new(IdSize::U32);
        let object = heap.object_class();
        let class = heap.define_class("Point", Some(object), &[FieldSpec::instance("x", "I")]);

        let mut cache = ClassMetadataCache::new(IdSize::U32);
        let first = cache.lookup_or_create(&heap, class).unwrap();
        let second = cache.lookup_or_create(&heap, class).unwrap();

        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(4, first.instance_size());
    }

    #[test]
    fn cache_is_purged_when_full() {
        let mut heap = InMemoryHeap::new(IdSize::U32);
        let object = heap.object_class();
        let classes = (0..CACHE_TOP + 10)
            .map(|i| {
                heap.define_class(
                    &format!("C{}", i),
                    Some(object),
                    &[FieldSpec::instance("v", "S")],
                )
            })
            .collect::<Vec<_>>();

        let mut cache = ClassMetadataCache::new(IdSize::U32);
        for (i, class) in classes.iter().enumerate() {
            let layout = cache.lookup_or_create(&heap, *class).unwrap();
            assert_eq!(2, layout.instance_size());
            assert!(cache.len() <= CACHE_TOP, "after {} lookups", i);
        }

        // purged once at CACHE_TOP, then refilled with the remainder
        assert_eq!(10, cache.len());
    }

    #[test]
    fn unknown_class_has_no_layout() {
        let heap = InMemoryHeap::new(IdSize::U32);
        let mut cache = ClassMetadataCache::new(IdSize::U32);

        assert!(cache.lookup_or_create(&heap, Id::new(0xBAD)).is_none());
        assert!(cache.is_empty());
    }
}
