//! Text form of operations, used by `--dump` and the debug logs.

use std::fmt::{self, Write as _};

use super::op::{Arg, Descr, Operation, Value, Var};

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.ty.prefix(), self.id.0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Ref(r) if r.is_null() => f.write_str("NULL"),
            Value::Ref(r) => write!(f, "@{:#x}", r.0),
            Value::Void => f.write_str("void"),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Var(v) => v.fmt(f),
            Arg::Const(c) => c.fmt(f),
        }
    }
}

impl fmt::Display for Descr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descr::Cell(h) => write!(f, "<Loop{}>", h.index()),
            Descr::Target(t) => write!(f, "<Target of Loop{}>", t.owner.index()),
            Descr::Guard(g) => write!(f, "<Guard {}>", g.guard_opnum()),
            Descr::Final(d) => write!(f, "<{d:?}>"),
            Descr::Field(d) => write!(f, "<Field {}>", d.name),
            Descr::Array(d) => write!(f, "<Array {:?}>", d.item_ty),
            Descr::Size(d) => write!(f, "<Size {}>", d.type_id),
            Descr::Call(d) => write!(f, "<Call {:?}>", d.result),
            Descr::QuasiImmut(q) => write!(f, "<QuasiImmut {}>", q.0),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "{result} = ")?;
        }
        write!(f, "{}(", self.opcode)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        if let Some(descr) = &self.descr {
            if !self.args.is_empty() {
                f.write_str(", ")?;
            }
            write!(f, "descr={descr}")?;
        }
        f.write_str(")")?;
        if let Some(fail_args) = &self.fail_args {
            f.write_str(" [")?;
            for (i, slot) in fail_args.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                match slot {
                    Some(v) => write!(f, "{v}")?,
                    None => f.write_str("None")?,
                }
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

/// Render an input list followed by one operation per line.
pub fn format_ops(inputargs: &[Var], operations: &[Operation]) -> String {
    let mut out = String::new();
    let inputs: Vec<String> = inputargs.iter().map(Var::to_string).collect();
    let _ = writeln!(out, "[{}]", inputs.join(", "));
    for op in operations {
        let _ = writeln!(out, "{op}");
    }
    out
}
