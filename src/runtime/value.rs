//! Representation of Scheme values

use gc_arena::{Collect, Gc, Mutation, RefLock};

use crate::{
    insn::CodeBlock,
    runtime::{Condition, Procedure},
    world::ModulePtr,
};

pub type Integer = i64;

/// Type that stores all possible values. Everything bigger than a machine
/// word lives behind a `Gc` pointer, so values themselves stay `Copy`.
#[derive(Collect, Clone, Copy, Default, Debug)]
#[collect(no_drop)]
pub enum Value<'gc> {
    // This is the value written as ()
    #[default]
    Null,
    // Attempting to use this value is an error
    // (but the binding exists for the purposes of set!)
    Undefined,
    // the return value of set! and definitions
    Void,
    Bool(bool),
    // For now, we only support exact integers, so
    Number(Integer),
    Symbol(Symbol),
    Str(Str),
    Pair(Gc<'gc, RefLock<Pair<'gc>>>),
    // Represents something runnable
    Procedure(Gc<'gc, Procedure<'gc>>),
    // compiled code is first-class: closure bodies travel as data
    Code(Gc<'gc, CodeBlock<'gc>>),
    Module(ModulePtr<'gc>),
    Condition(Gc<'gc, Condition<'gc>>),
}

impl<'gc> Value<'gc> {
    /// Only `#f` is false; every other value counts as true.
    pub fn is_false(&self) -> bool {
        matches!(self, Self::Bool(false))
    }

    pub fn as_number(&self) -> Option<Integer> {
        match self {
            Self::Number(int) => Some(*int),
            _ => None,
        }
    }

    pub fn as_procedure(&self) -> Option<Gc<'gc, Procedure<'gc>>> {
        match self {
            Self::Procedure(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<Symbol> {
        match self {
            Self::Symbol(s) => Some(*s),
            _ => None,
        }
    }

    pub fn cons(mc: &Mutation<'gc>, car: Value<'gc>, cdr: Value<'gc>) -> Value<'gc> {
        Value::Pair(Gc::new(mc, RefLock::new(Pair { car, cdr })))
    }

    /// Builds a proper list from `items`, right to left.
    pub fn list(mc: &Mutation<'gc>, items: impl IntoIterator<Item = Value<'gc>>) -> Value<'gc> {
        let items: Vec<_> = items.into_iter().collect();
        let mut tail = Value::Null;
        for item in items.into_iter().rev() {
            tail = Value::cons(mc, item, tail);
        }
        tail
    }

    /// Collects a proper list into a vector; `None` for improper lists.
    pub fn list_to_vec(&self) -> Option<Vec<Value<'gc>>> {
        let mut out = Vec::new();
        let mut cur = *self;
        loop {
            match cur {
                Value::Null => return Some(out),
                Value::Pair(p) => {
                    let pair = *p.borrow();
                    out.push(pair.car);
                    cur = pair.cdr;
                }
                _ => return None,
            }
        }
    }

    /// Pointer/immediate identity, the `eq?` notion of sameness.
    pub fn identical(&self, other: &Value<'gc>) -> bool {
        match (self, other) {
            (Value::Null, Value::Null)
            | (Value::Undefined, Value::Undefined)
            | (Value::Void, Value::Void) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Pair(a), Value::Pair(b)) => Gc::ptr_eq(*a, *b),
            (Value::Procedure(a), Value::Procedure(b)) => Gc::ptr_eq(*a, *b),
            (Value::Code(a), Value::Code(b)) => Gc::ptr_eq(*a, *b),
            (Value::Module(a), Value::Module(b)) => Gc::ptr_eq(*a, *b),
            (Value::Condition(a), Value::Condition(b)) => Gc::ptr_eq(*a, *b),
            _ => false,
        }
    }

    /// Renders a value for diagnostics. Needs the interner to resolve
    /// symbol and string names.
    pub fn describe(&self, rodeo: &lasso::Rodeo) -> String {
        match self {
            Value::Null => "()".into(),
            Value::Undefined => "#<undefined>".into(),
            Value::Void => "#<void>".into(),
            Value::Bool(true) => "#t".into(),
            Value::Bool(false) => "#f".into(),
            Value::Number(n) => n.to_string(),
            Value::Symbol(s) => rodeo.resolve(&s.0).to_owned(),
            Value::Str(s) => format!("{:?}", rodeo.resolve(&s.0)),
            Value::Pair(_) => {
                let mut out = String::from("(");
                let mut cur = *self;
                loop {
                    match cur {
                        Value::Pair(p) => {
                            let pair = *p.borrow();
                            if out.len() > 1 {
                                out.push(' ');
                            }
                            out.push_str(&pair.car.describe(rodeo));
                            cur = pair.cdr;
                        }
                        Value::Null => break,
                        last => {
                            out.push_str(" . ");
                            out.push_str(&last.describe(rodeo));
                            break;
                        }
                    }
                }
                out.push(')');
                out
            }
            Value::Procedure(p) => match p.as_ref() {
                Procedure::Closure(c) => format!("#<closure {}>", c.code.name),
                Procedure::Subr(s) => format!("#<subr {}>", s.name),
                Procedure::Continuation(_) => "#<continuation>".into(),
            },
            Value::Code(c) => format!("#<code {}>", c.name),
            Value::Module(m) => format!("#<module {}>", rodeo.resolve(&m.borrow().name.0)),
            Value::Condition(c) => {
                let mut out = format!("#<error {:?}", rodeo.resolve(&c.message.0));
                for irr in &c.irritants {
                    out.push(' ');
                    out.push_str(&irr.describe(rodeo));
                }
                out.push('>');
                out
            }
        }
    }
}

/// An interned symbol.
#[derive(Collect, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[collect(require_static)]
pub struct Symbol(pub lasso::Spur);

impl From<lasso::Spur> for Symbol {
    fn from(value: lasso::Spur) -> Self {
        Self(value)
    }
}

// Strings might not need to be in the GC, so
// only allow interned strings for now
#[derive(Collect, Clone, Copy, Debug, PartialEq, Eq)]
#[collect(require_static)]
pub struct Str(pub lasso::Spur);

impl From<lasso::Spur> for Str {
    fn from(value: lasso::Spur) -> Self {
        Self(value)
    }
}

// Steal a little bit of linked list
#[derive(Collect, Clone, Copy, Debug)]
#[collect(no_drop)]
pub struct Pair<'gc> {
    pub car: Value<'gc>,
    pub cdr: Value<'gc>,
}
