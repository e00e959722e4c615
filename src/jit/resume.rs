//! Resume data: what a guard needs to rebuild interpreter state.
//!
//! The numbering lists one [`Tagged`] entry per interpreter slot. An entry
//! either points into the dead frame's values, names a constant, or names a
//! virtual object that has to be allocated before the interpreter can see it.

use crate::ir::{ArrayDescr, FieldDescr, GcRef, SizeDescr, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tagged {
    /// Index into the dead frame's values.
    Box(u32),
    /// Index into [`ResumeData::consts`].
    Const(u32),
    /// Small integer stored inline.
    Int(i32),
    /// Index into [`ResumeData::virtuals`].
    Virtual(u32),
    Null,
}

/// Recipe for one virtual object.
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualInfo {
    Struct {
        descr: SizeDescr,
        fields: Vec<(FieldDescr, Tagged)>,
    },
    Array {
        descr: ArrayDescr,
        items: Vec<Tagged>,
    },
}

/// A heap write the optimizer delayed past the guard.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingField {
    pub target: Tagged,
    pub field: FieldDescr,
    /// `Some` for an array item write, `None` for a struct field.
    pub item_index: Option<usize>,
    pub value: Tagged,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeData {
    pub numb: Vec<Tagged>,
    pub consts: Vec<Value>,
    pub virtuals: Vec<VirtualInfo>,
    pub pending_fields: Vec<PendingField>,
    /// Number of fail arguments recorded for the guard.
    pub count: usize,
    /// Interpreter position execution resumes at. Kept by every copy of the
    /// guard, so it also identifies guards duplicated by loop peeling.
    pub position: u32,
}

impl ResumeData {
    /// Resume data that maps each interpreter slot straight to one fail
    /// argument.
    pub fn for_fail_args(count: usize) -> Self {
        ResumeData {
            numb: (0..count as u32).map(Tagged::Box).collect(),
            count,
            ..Self::default()
        }
    }

    pub fn at_position(position: u32) -> Self {
        ResumeData {
            position,
            ..Self::default()
        }
    }

    pub fn has_virtuals(&self) -> bool {
        !self.virtuals.is_empty()
    }
}

/// Materialized virtuals, indexed like [`ResumeData::virtuals`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VirtualCache {
    refs: Vec<Option<GcRef>>,
}

impl VirtualCache {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_refs(refs: Vec<GcRef>) -> Self {
        VirtualCache {
            refs: refs.into_iter().map(Some).collect(),
        }
    }

    fn with_len(len: usize) -> Self {
        VirtualCache { refs: vec![None; len] }
    }

    pub fn get(&self, index: usize) -> Option<GcRef> {
        self.refs.get(index).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Allocation and stores needed to materialize virtuals.
pub trait VirtualHeap {
    fn allocate_struct(&mut self, descr: &SizeDescr) -> GcRef;
    fn allocate_array(&mut self, descr: &ArrayDescr, len: usize) -> GcRef;
    fn set_field(&mut self, obj: GcRef, field: &FieldDescr, value: Value);
    fn set_array_item(&mut self, array: GcRef, index: usize, value: Value);
}

/// Decodes resume data against the values of one dead frame.
pub struct ResumeReader<'a> {
    data: &'a ResumeData,
    values: &'a [Value],
    heap: &'a mut dyn VirtualHeap,
    cache: VirtualCache,
}

impl<'a> ResumeReader<'a> {
    pub fn new(data: &'a ResumeData, values: &'a [Value], heap: &'a mut dyn VirtualHeap) -> Self {
        ResumeReader {
            data,
            values,
            heap,
            cache: VirtualCache::with_len(data.virtuals.len()),
        }
    }

    /// Reuse virtuals that were already materialized by a forcing.
    pub fn with_cache(mut self, cache: VirtualCache) -> Self {
        for (i, r) in cache.refs.iter().enumerate() {
            if let Some(slot) = self.cache.refs.get_mut(i) {
                *slot = *r;
            }
        }
        self
    }

    pub fn decode(&mut self, tagged: Tagged) -> Value {
        match tagged {
            Tagged::Box(i) => self.values.get(i as usize).copied().unwrap_or(Value::Void),
            Tagged::Const(i) => self.data.consts.get(i as usize).copied().unwrap_or(Value::Void),
            Tagged::Int(n) => Value::Int(n as i64),
            Tagged::Virtual(i) => Value::Ref(self.materialize(i as usize)),
            Tagged::Null => Value::Ref(GcRef::NULL),
        }
    }

    /// Allocate virtual `index` (once) and fill in its contents.
    pub fn materialize(&mut self, index: usize) -> GcRef {
        if let Some(obj) = self.cache.get(index) {
            return obj;
        }
        let data = self.data;
        let Some(info) = data.virtuals.get(index) else {
            return GcRef::NULL;
        };
        match info {
            VirtualInfo::Struct { descr, fields } => {
                let obj = self.heap.allocate_struct(descr);
                // cached before the fields so cycles terminate
                self.cache.refs[index] = Some(obj);
                for (field, tagged) in fields {
                    let value = self.decode(*tagged);
                    self.heap.set_field(obj, field, value);
                }
                obj
            }
            VirtualInfo::Array { descr, items } => {
                let obj = self.heap.allocate_array(descr, items.len());
                self.cache.refs[index] = Some(obj);
                for (i, tagged) in items.iter().enumerate() {
                    let value = self.decode(*tagged);
                    self.heap.set_array_item(obj, i, value);
                }
                obj
            }
        }
    }

    pub fn materialize_all(&mut self) {
        for index in 0..self.data.virtuals.len() {
            self.materialize(index);
        }
    }

    pub fn apply_pending_fields(&mut self) {
        let data = self.data;
        for pending in &data.pending_fields {
            let Value::Ref(target) = self.decode(pending.target) else {
                continue;
            };
            let value = self.decode(pending.value);
            match pending.item_index {
                Some(index) => self.heap.set_array_item(target, index, value),
                None => self.heap.set_field(target, &pending.field, value),
            }
        }
    }

    /// Values of every interpreter slot, materializing virtuals on the way.
    pub fn read_frame(&mut self) -> Vec<Value> {
        let data = self.data;
        data.numb.iter().map(|t| self.decode(*t)).collect()
    }

    pub fn into_cache(self) -> VirtualCache {
        self.cache
    }
}

/// Materialize every virtual of `data` and perform its pending writes.
pub fn force_from_resumedata(data: &ResumeData, values: &[Value], heap: &mut dyn VirtualHeap) -> VirtualCache {
    let mut reader = ResumeReader::new(data, values, heap);
    reader.materialize_all();
    reader.apply_pending_fields();
    reader.into_cache()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;
    use crate::sim::ArenaHeap;

    fn point() -> SizeDescr {
        SizeDescr { type_id: 1, size: 16 }
    }

    #[test]
    fn test_for_fail_args() {
        let data = ResumeData::for_fail_args(2);
        assert_eq!(data.numb, vec![Tagged::Box(0), Tagged::Box(1)]);
        assert_eq!(data.count, 2);
    }

    #[test]
    fn test_read_frame_decodes_boxes_and_constants() {
        let data = ResumeData {
            numb: vec![Tagged::Box(1), Tagged::Const(0), Tagged::Int(-3), Tagged::Null],
            consts: vec![Value::Float(1.5)],
            ..ResumeData::default()
        };
        let mut heap = ArenaHeap::new();
        let values = [Value::Int(10), Value::Int(20)];
        let frame = ResumeReader::new(&data, &values, &mut heap).read_frame();
        assert_eq!(
            frame,
            vec![Value::Int(20), Value::Float(1.5), Value::Int(-3), Value::Ref(GcRef::NULL)]
        );
    }

    #[test]
    fn test_force_materializes_each_virtual_once() {
        let x = FieldDescr::new("x", Type::Int, 0);
        let next = FieldDescr::new("next", Type::Ref, 8);
        let data = ResumeData {
            numb: vec![Tagged::Virtual(0), Tagged::Virtual(0)],
            virtuals: vec![VirtualInfo::Struct {
                descr: point(),
                fields: vec![(x.clone(), Tagged::Box(0)), (next.clone(), Tagged::Virtual(0))],
            }],
            ..ResumeData::default()
        };
        let mut heap = ArenaHeap::new();
        let cache = force_from_resumedata(&data, &[Value::Int(7)], &mut heap);
        let obj = cache.get(0).unwrap();
        assert_eq!(heap.allocations(), 1);
        assert_eq!(heap.field(obj, "x"), Some(Value::Int(7)));
        assert_eq!(heap.field(obj, "next"), Some(Value::Ref(obj)));
    }

    #[test]
    fn test_reader_reuses_forced_cache() {
        let data = ResumeData {
            numb: vec![Tagged::Virtual(0)],
            virtuals: vec![VirtualInfo::Array {
                descr: ArrayDescr { item_ty: Type::Int },
                items: vec![Tagged::Int(1)],
            }],
            ..ResumeData::default()
        };
        let mut heap = ArenaHeap::new();
        let forced = force_from_resumedata(&data, &[], &mut heap);
        let frame = ResumeReader::new(&data, &[], &mut heap).with_cache(forced.clone()).read_frame();
        assert_eq!(frame, vec![Value::Ref(forced.get(0).unwrap())]);
        assert_eq!(heap.allocations(), 1);
    }

    #[test]
    fn test_pending_fields_are_written() {
        let f = FieldDescr::new("f", Type::Int, 0);
        let data = ResumeData {
            pending_fields: vec![PendingField {
                target: Tagged::Box(0),
                field: f,
                item_index: None,
                value: Tagged::Int(5),
            }],
            ..ResumeData::default()
        };
        let mut heap = ArenaHeap::new();
        let obj = heap.allocate_struct(&point());
        force_from_resumedata(&data, &[Value::Ref(obj)], &mut heap);
        assert_eq!(heap.field(obj, "f"), Some(Value::Int(5)));
    }
}
