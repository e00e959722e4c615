//! Trace operations and their operands.
//!
//! Every operation that produces a value carries a typed result [`Var`];
//! the [`ValueId`] inside it is the identity that optimizer rewrites and
//! resume data refer to. Operations never carry rewrite state themselves:
//! replacements live in a [`ForwardingTable`](crate::ir::ForwardingTable)
//! owned by whichever phase needs them.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::jit::{FinalDescr, ResumeGuardDescr, TargetToken, UnitHandle};

/// Value kinds understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    Int,
    Ref,
    Float,
    Void,
}

impl Type {
    /// Single-letter prefix used when printing variables.
    pub fn prefix(self) -> char {
        match self {
            Type::Int => 'i',
            Type::Ref => 'p',
            Type::Float => 'f',
            Type::Void => 'v',
        }
    }

    /// Zero value of this type (used for fresh input arguments).
    pub fn zero(self) -> Value {
        match self {
            Type::Int => Value::Int(0),
            Type::Ref => Value::Ref(GcRef::NULL),
            Type::Float => Value::Float(0.0),
            Type::Void => Value::Void,
        }
    }
}

/// Identity of one SSA value inside a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Opaque address of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct GcRef(pub u64);

impl GcRef {
    pub const NULL: GcRef = GcRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A runtime value as seen by the interpreter or stored in a dead frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Ref(GcRef),
    Float(f64),
    Void,
}

impl Value {
    pub fn ty(&self) -> Type {
        match self {
            Value::Int(_) => Type::Int,
            Value::Ref(_) => Type::Ref,
            Value::Float(_) => Type::Float,
            Value::Void => Type::Void,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<GcRef> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Bitwise equality (floats compare by bit pattern, like constants do).
    pub fn same_constant(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

/// A typed reference to a value produced inside a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var {
    pub id: ValueId,
    pub ty: Type,
}

impl Var {
    pub fn new(id: u32, ty: Type) -> Self {
        Var {
            id: ValueId(id),
            ty,
        }
    }

    pub fn int(id: u32) -> Self {
        Var::new(id, Type::Int)
    }

    pub fn reference(id: u32) -> Self {
        Var::new(id, Type::Ref)
    }

    pub fn float(id: u32) -> Self {
        Var::new(id, Type::Float)
    }
}

/// An operation argument: either a trace value or a constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Var(Var),
    Const(Value),
}

impl Arg {
    pub fn int(n: i64) -> Self {
        Arg::Const(Value::Int(n))
    }

    pub fn ty(&self) -> Type {
        match self {
            Arg::Var(v) => v.ty,
            Arg::Const(c) => c.ty(),
        }
    }

    pub fn as_var(&self) -> Option<Var> {
        match self {
            Arg::Var(v) => Some(*v),
            Arg::Const(_) => None,
        }
    }

    pub fn as_const(&self) -> Option<Value> {
        match self {
            Arg::Const(c) => Some(*c),
            Arg::Var(_) => None,
        }
    }
}

impl From<Var> for Arg {
    fn from(v: Var) -> Self {
        Arg::Var(v)
    }
}

/// Operation codes recorded by the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    Label,
    Jump,
    Finish,
    SameAs,

    IntAdd,
    IntSub,
    IntMul,
    IntAnd,
    IntOr,
    IntXor,
    IntLshift,
    IntRshift,
    IntNeg,
    IntIsTrue,
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    IntAddOvf,
    IntSubOvf,
    IntMulOvf,

    FloatAdd,
    FloatSub,
    FloatMul,
    FloatTruediv,
    FloatLt,
    FloatEq,

    PtrEq,
    PtrNe,

    GuardTrue,
    GuardFalse,
    GuardValue,
    GuardClass,
    GuardNonnull,
    GuardIsnull,
    GuardNonnullClass,
    GuardNoException,
    GuardException,
    GuardOverflow,
    GuardNoOverflow,
    GuardNotForced,
    GuardNotForced2,
    GuardNotInvalidated,
    GuardFutureCondition,

    GetfieldGc,
    SetfieldGc,
    GetarrayitemGc,
    SetarrayitemGc,
    ArraylenGc,
    New,
    NewWithVtable,
    NewArray,

    Call,
    CallPure,
    CallMayForce,
    CallAssembler,

    QuasiimmutField,
    ForceToken,
}

impl OpCode {
    pub fn is_guard(self) -> bool {
        matches!(
            self,
            OpCode::GuardTrue
                | OpCode::GuardFalse
                | OpCode::GuardValue
                | OpCode::GuardClass
                | OpCode::GuardNonnull
                | OpCode::GuardIsnull
                | OpCode::GuardNonnullClass
                | OpCode::GuardNoException
                | OpCode::GuardException
                | OpCode::GuardOverflow
                | OpCode::GuardNoOverflow
                | OpCode::GuardNotForced
                | OpCode::GuardNotForced2
                | OpCode::GuardNotInvalidated
                | OpCode::GuardFutureCondition
        )
    }

    /// Operations that end a trace.
    pub fn is_final(self) -> bool {
        matches!(self, OpCode::Jump | OpCode::Finish)
    }

    /// Pure integer operations that can be folded on constant inputs.
    pub fn is_foldable_int(self) -> bool {
        matches!(
            self,
            OpCode::IntAdd
                | OpCode::IntSub
                | OpCode::IntMul
                | OpCode::IntAnd
                | OpCode::IntOr
                | OpCode::IntXor
                | OpCode::IntLshift
                | OpCode::IntRshift
                | OpCode::IntNeg
                | OpCode::IntIsTrue
                | OpCode::IntLt
                | OpCode::IntLe
                | OpCode::IntEq
                | OpCode::IntNe
                | OpCode::IntGt
                | OpCode::IntGe
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Label => "label",
            OpCode::Jump => "jump",
            OpCode::Finish => "finish",
            OpCode::SameAs => "same_as",
            OpCode::IntAdd => "int_add",
            OpCode::IntSub => "int_sub",
            OpCode::IntMul => "int_mul",
            OpCode::IntAnd => "int_and",
            OpCode::IntOr => "int_or",
            OpCode::IntXor => "int_xor",
            OpCode::IntLshift => "int_lshift",
            OpCode::IntRshift => "int_rshift",
            OpCode::IntNeg => "int_neg",
            OpCode::IntIsTrue => "int_is_true",
            OpCode::IntLt => "int_lt",
            OpCode::IntLe => "int_le",
            OpCode::IntEq => "int_eq",
            OpCode::IntNe => "int_ne",
            OpCode::IntGt => "int_gt",
            OpCode::IntGe => "int_ge",
            OpCode::IntAddOvf => "int_add_ovf",
            OpCode::IntSubOvf => "int_sub_ovf",
            OpCode::IntMulOvf => "int_mul_ovf",
            OpCode::FloatAdd => "float_add",
            OpCode::FloatSub => "float_sub",
            OpCode::FloatMul => "float_mul",
            OpCode::FloatTruediv => "float_truediv",
            OpCode::FloatLt => "float_lt",
            OpCode::FloatEq => "float_eq",
            OpCode::PtrEq => "ptr_eq",
            OpCode::PtrNe => "ptr_ne",
            OpCode::GuardTrue => "guard_true",
            OpCode::GuardFalse => "guard_false",
            OpCode::GuardValue => "guard_value",
            OpCode::GuardClass => "guard_class",
            OpCode::GuardNonnull => "guard_nonnull",
            OpCode::GuardIsnull => "guard_isnull",
            OpCode::GuardNonnullClass => "guard_nonnull_class",
            OpCode::GuardNoException => "guard_no_exception",
            OpCode::GuardException => "guard_exception",
            OpCode::GuardOverflow => "guard_overflow",
            OpCode::GuardNoOverflow => "guard_no_overflow",
            OpCode::GuardNotForced => "guard_not_forced",
            OpCode::GuardNotForced2 => "guard_not_forced_2",
            OpCode::GuardNotInvalidated => "guard_not_invalidated",
            OpCode::GuardFutureCondition => "guard_future_condition",
            OpCode::GetfieldGc => "getfield_gc",
            OpCode::SetfieldGc => "setfield_gc",
            OpCode::GetarrayitemGc => "getarrayitem_gc",
            OpCode::SetarrayitemGc => "setarrayitem_gc",
            OpCode::ArraylenGc => "arraylen_gc",
            OpCode::New => "new",
            OpCode::NewWithVtable => "new_with_vtable",
            OpCode::NewArray => "new_array",
            OpCode::Call => "call",
            OpCode::CallPure => "call_pure",
            OpCode::CallMayForce => "call_may_force",
            OpCode::CallAssembler => "call_assembler",
            OpCode::QuasiimmutField => "quasiimmut_field",
            OpCode::ForceToken => "force_token",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Descriptor of a struct field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescr {
    pub name: Rc<str>,
    pub ty: Type,
    pub offset: usize,
}

impl FieldDescr {
    pub fn new(name: &str, ty: Type, offset: usize) -> Self {
        FieldDescr {
            name: Rc::from(name),
            ty,
            offset,
        }
    }
}

/// Descriptor of an array's item type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayDescr {
    pub item_ty: Type,
}

/// Descriptor of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeDescr {
    pub type_id: u32,
    pub size: usize,
}

/// Descriptor of a call target's signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallDescr {
    pub args: Vec<Type>,
    pub result: Type,
}

/// Identity of a quasi-immutable field slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuasiImmutId(pub u32);

/// Operation descriptors.
#[derive(Debug, Clone)]
pub enum Descr {
    /// A whole compiled unit (loop header label, `call_assembler`, or a jump
    /// not yet resolved to one of the unit's entry points).
    Cell(UnitHandle),
    /// One entry point of a compiled unit.
    Target(Rc<TargetToken>),
    Guard(Rc<ResumeGuardDescr>),
    Final(FinalDescr),
    Field(FieldDescr),
    Array(ArrayDescr),
    Size(SizeDescr),
    Call(CallDescr),
    QuasiImmut(QuasiImmutId),
}

impl Descr {
    pub fn as_target(&self) -> Option<&Rc<TargetToken>> {
        match self {
            Descr::Target(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_guard(&self) -> Option<&Rc<ResumeGuardDescr>> {
        match self {
            Descr::Guard(g) => Some(g),
            _ => None,
        }
    }
}

/// One recorded or optimized operation.
#[derive(Debug, Clone)]
pub struct Operation {
    pub opcode: OpCode,
    pub result: Option<Var>,
    pub args: Vec<Arg>,
    pub descr: Option<Descr>,
    pub fail_args: Option<Vec<Option<Var>>>,
}

impl Operation {
    pub fn new(opcode: OpCode, args: Vec<Arg>) -> Self {
        Operation {
            opcode,
            result: None,
            args,
            descr: None,
            fail_args: None,
        }
    }

    pub fn with_result(mut self, result: Var) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_descr(mut self, descr: Descr) -> Self {
        self.descr = Some(descr);
        self
    }

    pub fn with_fail_args(mut self, fail_args: Vec<Option<Var>>) -> Self {
        self.fail_args = Some(fail_args);
        self
    }

    /// `label(args)` with the given descriptor.
    pub fn label(args: &[Var], descr: Descr) -> Self {
        Operation::new(OpCode::Label, args.iter().copied().map(Arg::Var).collect()).with_descr(descr)
    }

    /// `jump(args)` with the given descriptor.
    pub fn jump(args: Vec<Arg>, descr: Descr) -> Self {
        Operation::new(OpCode::Jump, args).with_descr(descr)
    }

    pub fn is_guard(&self) -> bool {
        self.opcode.is_guard()
    }

    pub fn ty(&self) -> Type {
        self.result.map(|r| r.ty).unwrap_or(Type::Void)
    }

    pub fn arg(&self, index: usize) -> Arg {
        self.args[index]
    }

    /// Arguments of a label, all of which are variables by construction.
    pub fn label_args(&self) -> Vec<Var> {
        debug_assert_eq!(self.opcode, OpCode::Label);
        self.args.iter().filter_map(Arg::as_var).collect()
    }

    pub fn fail_args(&self) -> &[Option<Var>] {
        self.fail_args.as_deref().unwrap_or(&[])
    }

    pub fn clear_descr(&mut self) {
        self.descr = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_classification() {
        assert!(OpCode::GuardValue.is_guard());
        assert!(OpCode::GuardNotForced2.is_guard());
        assert!(!OpCode::IntAdd.is_guard());
        assert!(!OpCode::Jump.is_guard());
    }

    #[test]
    fn test_opcode_serde_names_match_display() {
        let json = serde_json::to_string(&OpCode::GuardNoOverflow).unwrap();
        assert_eq!(json, "\"guard_no_overflow\"");
        assert_eq!(OpCode::GuardNoOverflow.to_string(), "guard_no_overflow");
    }

    #[test]
    fn test_label_args() {
        let op = Operation::label(&[Var::int(0), Var::reference(1)], Descr::Cell(UnitHandle::dangling()));
        assert_eq!(op.label_args(), vec![Var::int(0), Var::reference(1)]);
    }

    #[test]
    fn test_float_constants_compare_bitwise() {
        assert!(Value::Float(f64::NAN).same_constant(&Value::Float(f64::NAN)));
        assert!(!Value::Float(0.0).same_constant(&Value::Float(-0.0)));
    }

    #[test]
    fn test_vars_order_by_id() {
        let set: std::collections::BTreeSet<Var> =
            [Var::reference(2), Var::int(0), Var::new(1, Type::Float)].into_iter().collect();
        let ids: Vec<u32> = set.iter().map(|v| v.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(Type::Int < Type::Void);
    }
}
