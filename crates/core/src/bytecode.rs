//! Bytecode data types (§3, §4.6, §4.7).
//!
//! The instruction byte values are fixed by the spec so that compiled
//! bodies are portable between a compiler and a VM built from this same
//! contract (§6: "the spec fixes the instruction byte values... so that
//! implementations may interop and test corpora may be reused").

use crate::heap::HeapRef;
use crate::sha256;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// One opcode byte. Immediates are 2-byte little-endian i16/u16 or a single
/// u8, as specified per-instruction in §4.7's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Op {
    Cnil = 0,
    Pop = 1,
    Ldc = 2,
    Ldl = 3,
    Lddv = 4,
    Ldv = 5,
    Lddf = 6,
    Stl = 7,
    Stvv = 8,
    Stvm = 9,
    Setv = 10,
    Br = 11,
    Bnil = 12,
    Bnnil = 13,
    Call = 14,
    Apply = 15,
    Throw = 16,
    Ifn = 17,
    Ubxi64 = 18,
    Bxi64 = 19,
    Addi64 = 20,
    /// Field access/mutation family, fixed per §4.6 design-note resolution
    /// of the `LDDF`/`STDF`/`LDSF`/`STSF` open question: object-field
    /// access and mutation by name.
    Stdf = 21,
    Ldsf = 22,
    Stsf = 23,
    /// Marks the logical end of a body; the VM's frame-depth invariant
    /// (§8 property 5) is checked against this point.
    Ret = 24,
}

impl Op {
    pub fn from_byte(b: u8) -> Option<Op> {
        use Op::*;
        Some(match b {
            0 => Cnil,
            1 => Pop,
            2 => Ldc,
            3 => Ldl,
            4 => Lddv,
            5 => Ldv,
            6 => Lddf,
            7 => Stl,
            8 => Stvv,
            9 => Stvm,
            10 => Setv,
            11 => Br,
            12 => Bnil,
            13 => Bnnil,
            14 => Call,
            15 => Apply,
            16 => Throw,
            17 => Ifn,
            18 => Ubxi64,
            19 => Bxi64,
            20 => Addi64,
            21 => Stdf,
            22 => Ldsf,
            23 => Stsf,
            24 => Ret,
            _ => return None,
        })
    }
}

/// One entry of the exception table: an instruction range, a handler
/// offset, the saved stack depth at the handler, and the exception type
/// to match (`None` matches any), per §3/§4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionEntry {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub saved_stack_depth: u32,
    /// Type name to match via `isa?`; `None` matches any exception.
    pub exc_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionTable {
    pub entries: Vec<ExceptionEntry>,
}

impl ExceptionTable {
    pub fn empty() -> Self {
        ExceptionTable { entries: Vec::new() }
    }

    /// First entry (in table order) whose range covers `offset` and whose
    /// type matches, per §4.7 ("entries scanned in order").
    pub fn find(&self, offset: u32, isa: impl Fn(&str) -> bool) -> Option<&ExceptionEntry> {
        self.entries.iter().find(|e| {
            e.start <= offset
                && offset < e.end
                && e.exc_type.as_deref().is_none_or(&isa)
        })
    }
}

/// One arity's compiled body (§3). `arity` follows §4.6: non-negative for
/// fixed arity, `-(fixed+1)` for a variadic body whose fixed prefix count
/// is `fixed` (so a variadic body with 0 required args is `-1`, disjoint
/// from the fixed-arity-0 body `0`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BytecodeFnBody {
    pub arity: i32,
    #[serde(skip)]
    pub consts: Vec<Value>,
    /// Fully-qualified var names referenced by `LDV`/`LDDV`/`SETV`/`STVV`/`STVM`.
    pub vars: Vec<String>,
    pub locals_size: u16,
    pub code: Vec<u8>,
    pub exception_table: ExceptionTable,
}

impl BytecodeFnBody {
    pub fn is_variadic(&self) -> bool {
        self.arity < 0
    }

    pub fn fixed_arity(&self) -> u32 {
        if self.arity < 0 {
            (-self.arity - 1) as u32
        } else {
            self.arity as u32
        }
    }

    /// Content hash over the serializable (non-`Value`) parts of the body,
    /// for the bytecode cache (new: supplementing the distilled spec, see
    /// SPEC_FULL.md §4.9).
    pub fn content_hash(&self) -> [u8; 32] {
        let bytes = bincode::serialize(&(self.arity, &self.vars, self.locals_size, &self.code))
            .expect("bytecode body fields are always serializable");
        sha256::digest(&bytes)
    }
}

/// A function: a name plus bodies sorted by arity, at most one variadic
/// body and it must be last (§3).
#[derive(Debug, Clone)]
pub struct BytecodeFnData {
    pub name: Option<String>,
    pub bodies: Vec<HeapRef>,
}

impl BytecodeFnData {
    /// §8 property 6 / §4.7: the fixed-arity body with `arity == n` if one
    /// exists, else the variadic body whose fixed arity is `<= n`, else
    /// `None`.
    pub fn find_body<'a>(
        &self,
        n: u32,
        get_body: impl Fn(HeapRef) -> &'a BytecodeFnBody,
    ) -> Option<(HeapRef, &'a BytecodeFnBody)> {
        for &r in &self.bodies {
            let body = get_body(r);
            if !body.is_variadic() && body.fixed_arity() == n {
                return Some((r, body));
            }
        }
        if let Some(&last) = self.bodies.last() {
            let body = get_body(last);
            if body.is_variadic() && body.fixed_arity() <= n {
                return Some((last, body));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(arity: i32) -> BytecodeFnBody {
        BytecodeFnBody {
            arity,
            consts: Vec::new(),
            vars: Vec::new(),
            locals_size: 0,
            code: Vec::new(),
            exception_table: ExceptionTable::empty(),
        }
    }

    #[test]
    fn fixed_arity_and_variadic_distinguish() {
        let fixed0 = body(0);
        let variadic0 = body(-1);
        assert_eq!(fixed0.fixed_arity(), 0);
        assert!(!fixed0.is_variadic());
        assert_eq!(variadic0.fixed_arity(), 0);
        assert!(variadic0.is_variadic());
    }

    #[test]
    fn exception_table_scans_in_order_and_respects_type() {
        let table = ExceptionTable {
            entries: vec![
                ExceptionEntry {
                    start: 0,
                    end: 10,
                    handler: 20,
                    saved_stack_depth: 0,
                    exc_type: Some("IllegalArgument".into()),
                },
                ExceptionEntry {
                    start: 0,
                    end: 10,
                    handler: 30,
                    saved_stack_depth: 0,
                    exc_type: None,
                },
            ],
        };
        let found = table.find(5, |t| t == "ArithmeticException");
        assert_eq!(found.unwrap().handler, 30);
        let found = table.find(5, |t| t == "IllegalArgument");
        assert_eq!(found.unwrap().handler, 20);
    }
}
