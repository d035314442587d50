//! VM Core: registers, two-stack execution, call frames, dispatch loop.
//!
//! This is the execution substrate spec.md calls out as the hard part: a
//! byte-oriented fetch/decode/dispatch loop over the CODE segment, reading
//! and writing the data stack (`Segment::Stack`) and return stack
//! (`Segment::RStack`) through `svm_core::segments::Memory`, with every
//! value passing through the tagged-value codec (`svm_core::value`).
//!
//! Opcode space (`Op`, one byte, 0-127) is shared between VM-internal
//! control instructions (`PushLiteral`, `Branch`, `Enter`, ...) and the
//! named built-in operations `crate::builtins` dispatches to — both are
//! just bytes with the top bit clear. A byte with the top bit *set* is
//! never an `Op` at all: combined with the next byte it is a direct
//! 15-bit call address into CODE (spec §4.5), which is how user-defined
//! words are invoked without going through the dictionary at run time.

use svm_core::segments::{Memory, Segment, SegmentSizes};
use svm_core::value::{Tag, TaggedValue, NIL};

use crate::dict::Dictionary;
use crate::digest::StringDigest;
use crate::error::{display_cell, from_core_error, RuntimeError, StackSnapshot, VmError};

/// VM-internal control instructions and named built-ins share one opcode
/// byte space (0-127); bit 7 set means "this byte pair is a call address",
/// not an `Op` at all (see module docs).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // --- control: compiler-internal, never bound to a dictionary name ---
    /// Followed by 4 raw bytes: the little-endian bits of a tagged cell.
    PushLiteral = 0,
    /// Followed by a signed 16-bit relative offset.
    Branch = 1,
    /// Pops a condition first; same operand shape as `Branch`.
    Branch0 = 2,
    /// Followed by one byte: the local-slot count to reserve. Prologue of
    /// every colon definition.
    Enter = 3,
    /// Epilogue of every colon definition and of `eval`-entered code.
    Exit = 4,
    /// Followed by one byte: the local-slot index to push.
    PushLocal = 5,
    /// Followed by one byte: the local-slot index to pop TOS into.
    StoreLocal = 6,
    /// `(` — records the current SP on the return stack.
    Mark = 7,
    /// `)` — pops the mark, computes the count pushed since, emits a LIST
    /// header over those cells.
    EndList = 8,

    // --- stack manipulation ---
    Dup = 16,
    Drop = 17,
    Swap = 18,
    Over = 19,
    Rot = 20,
    NRot = 21,
    Nip = 22,
    Tuck = 23,
    Pick = 24,
    Roll = 25,
    Depth = 26,
    Clear = 27,
    TwoDup = 28,
    TwoDrop = 29,
    TwoSwap = 30,

    // --- arithmetic ---
    Add = 32,
    Sub = 33,
    Mul = 34,
    Div = 35,
    Mod = 36,
    Neg = 37,
    Abs = 38,
    Min = 39,
    Max = 40,
    Pow = 41,
    Sqrt = 42,
    Exp = 43,
    Ln = 44,
    Sin = 45,
    Cos = 46,
    Tan = 47,

    // --- comparison / logic ---
    Eq = 48,
    Neq = 49,
    Lt = 50,
    Le = 51,
    Gt = 52,
    Ge = 53,
    And = 54,
    Or = 55,
    Not = 56,
    EqZero = 57,
    GtZero = 58,
    LtZero = 59,

    // --- control combinators ---
    Eval = 64,
    IfElse = 65,
    Abort = 66,

    // --- list construction / structural ---
    Enlist = 72,
    Pack = 73,
    Unpack = 74,
    Cons = 75,
    Uncons = 76,
    Head = 77,
    Tail = 78,
    Append = 79,
    Concat = 80,
    Reverse = 81,
    Length = 82,
    Slots = 83,

    // --- list access ---
    SlotOp = 88,
    ElemOp = 89,
    Fetch = 90,
    StoreAddr = 91,
    Get = 92,
    Set = 93,

    // --- sort / search ---
    Sort = 96,
    MapSort = 97,
    Find = 98,
    BFind = 99,
    HIndex = 100,
    HFind = 101,

    // --- I/O ---
    Print = 104,
    RawPrint = 105,
    Dot = 106,
    Nl = 107,
}

impl Op {
    pub fn from_u8(byte: u8) -> Option<Op> {
        use Op::*;
        Some(match byte {
            0 => PushLiteral,
            1 => Branch,
            2 => Branch0,
            3 => Enter,
            4 => Exit,
            5 => PushLocal,
            6 => StoreLocal,
            7 => Mark,
            8 => EndList,
            16 => Dup,
            17 => Drop,
            18 => Swap,
            19 => Over,
            20 => Rot,
            21 => NRot,
            22 => Nip,
            23 => Tuck,
            24 => Pick,
            25 => Roll,
            26 => Depth,
            27 => Clear,
            28 => TwoDup,
            29 => TwoDrop,
            30 => TwoSwap,
            32 => Add,
            33 => Sub,
            34 => Mul,
            35 => Div,
            36 => Mod,
            37 => Neg,
            38 => Abs,
            39 => Min,
            40 => Max,
            41 => Pow,
            42 => Sqrt,
            43 => Exp,
            44 => Ln,
            45 => Sin,
            46 => Cos,
            47 => Tan,
            48 => Eq,
            49 => Neq,
            50 => Lt,
            51 => Le,
            52 => Gt,
            53 => Ge,
            54 => And,
            55 => Or,
            56 => Not,
            57 => EqZero,
            58 => GtZero,
            59 => LtZero,
            64 => Eval,
            65 => IfElse,
            66 => Abort,
            72 => Enlist,
            73 => Pack,
            74 => Unpack,
            75 => Cons,
            76 => Uncons,
            77 => Head,
            78 => Tail,
            79 => Append,
            80 => Concat,
            81 => Reverse,
            82 => Length,
            83 => Slots,
            88 => SlotOp,
            89 => ElemOp,
            90 => Fetch,
            91 => StoreAddr,
            92 => Get,
            93 => Set,
            96 => Sort,
            97 => MapSort,
            98 => Find,
            99 => BFind,
            100 => HIndex,
            101 => HFind,
            104 => Print,
            105 => RawPrint,
            106 => Dot,
            107 => Nl,
            _ => return None,
        })
    }
}

/// Session-scoped segment sizes and dictionary capacity. `Default` mirrors
/// `svm_core::segments::SegmentSizes::default` plus a workable dictionary
/// size for an interactive session.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub segments: SegmentSizes,
    pub dictionary_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            segments: SegmentSizes::default(),
            dictionary_capacity: 1024,
        }
    }
}

/// The return-stack cell layout for one call frame: return address (byte
/// offset in CODE) pushed by the call itself, saved BP pushed by the
/// callee's `Enter`, then N local slots. `BP` points at local slot 0.
pub struct Vm {
    pub(crate) mem: Memory,
    pub dict: Dictionary,
    pub digest: StringDigest,
    /// Byte offset in CODE of the next instruction to fetch.
    pub ip: usize,
    /// Byte offset one past the highest used cell of the data stack.
    pub sp: usize,
    /// Byte offset one past the highest used cell of the return stack.
    pub rp: usize,
    /// Byte offset of local slot 0 in the return stack, for the active frame.
    pub bp: usize,
    /// High-water mark of the CODE segment; the compiler appends here.
    pub code_used: usize,
    pub running: bool,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let mem = Memory::new(config.segments);
        let mut vm = Vm {
            mem,
            dict: Dictionary::new(config.dictionary_capacity),
            digest: StringDigest::new(),
            ip: 0,
            sp: 0,
            rp: 0,
            bp: 0,
            code_used: 0,
            running: true,
        };
        crate::builtins::install(&mut vm).expect("bootstrap vocabulary fits the dictionary");
        vm
    }

    // =========================================================================
    // Data stack
    // =========================================================================

    pub fn push(&mut self, v: TaggedValue) -> Result<(), RuntimeError> {
        self.mem
            .write_cell(Segment::Stack, self.sp, v.to_bits())
            .map_err(|e| {
                from_core_error(
                    e,
                    RuntimeError::StackOverflow {
                        context: "data stack",
                    },
                )
            })?;
        self.sp += 4;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<TaggedValue, RuntimeError> {
        if self.sp < 4 {
            return Err(RuntimeError::StackUnderflow {
                context: "data stack",
            });
        }
        self.sp -= 4;
        let bits = self.mem.read_cell(Segment::Stack, self.sp).map_err(|e| {
            from_core_error(
                e,
                RuntimeError::StackUnderflow {
                    context: "data stack",
                },
            )
        })?;
        Ok(TaggedValue::from_bits(bits))
    }

    /// Peek `depth` cells below TOS without popping (depth 0 = TOS).
    pub fn peek(&self, depth: usize) -> Result<TaggedValue, RuntimeError> {
        let offset = 4 * (depth + 1);
        if self.sp < offset {
            return Err(RuntimeError::StackUnderflow {
                context: "data stack",
            });
        }
        let bits = self
            .mem
            .read_cell(Segment::Stack, self.sp - offset)
            .map_err(|e| {
                from_core_error(
                    e,
                    RuntimeError::StackUnderflow {
                        context: "data stack",
                    },
                )
            })?;
        Ok(TaggedValue::from_bits(bits))
    }

    pub fn depth(&self) -> usize {
        self.sp / 4
    }

    pub(crate) fn mem(&self) -> &Memory {
        &self.mem
    }

    pub(crate) fn mem_mut(&mut self) -> &mut Memory {
        &mut self.mem
    }

    /// Pop and decode as a plain numeric index (NUMBER or INTEGER), as
    /// several built-ins (`pick`, `roll`, `elem`, `get`'s path segments)
    /// need.
    pub fn pop_index(&mut self, context: &'static str) -> Result<i32, RuntimeError> {
        let v = self.pop()?;
        self.as_index(v, context)
    }

    pub fn as_index(&self, v: TaggedValue, context: &'static str) -> Result<i32, RuntimeError> {
        if v.is_number() {
            Ok(v.as_float() as i32)
        } else if v.tag() == Tag::Integer {
            Ok(v.as_integer() as i32)
        } else {
            Err(RuntimeError::TypeError {
                context,
                got: display_cell(v),
            })
        }
    }

    // =========================================================================
    // Return stack
    // =========================================================================

    fn push_r(&mut self, raw: u32) -> Result<(), RuntimeError> {
        self.mem
            .write_cell(Segment::RStack, self.rp, raw)
            .map_err(|e| {
                from_core_error(
                    e,
                    RuntimeError::StackOverflow {
                        context: "return stack",
                    },
                )
            })?;
        self.rp += 4;
        Ok(())
    }

    fn pop_r(&mut self) -> Result<u32, RuntimeError> {
        if self.rp < 4 {
            return Err(RuntimeError::StackUnderflow {
                context: "return stack",
            });
        }
        self.rp -= 4;
        self.mem.read_cell(Segment::RStack, self.rp).map_err(|e| {
            from_core_error(
                e,
                RuntimeError::StackUnderflow {
                    context: "return stack",
                },
            )
        })
    }

    // =========================================================================
    // Code segment (compiler-facing)
    // =========================================================================

    pub fn emit_byte(&mut self, byte: u8) -> Result<usize, RuntimeError> {
        let at = self
            .mem
            .append_bytes(Segment::Code, self.code_used, &[byte])
            .map_err(|e| from_core_error(e, RuntimeError::CodeSegmentFull))?;
        self.code_used += 1;
        Ok(at)
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<usize, RuntimeError> {
        let at = self
            .mem
            .append_bytes(Segment::Code, self.code_used, bytes)
            .map_err(|e| from_core_error(e, RuntimeError::CodeSegmentFull))?;
        self.code_used += bytes.len();
        Ok(at)
    }

    pub fn patch_u8(&mut self, at: usize, byte: u8) -> Result<(), RuntimeError> {
        self.mem
            .write_byte(Segment::Code, at, byte)
            .map_err(|e| from_core_error(e, RuntimeError::CodeSegmentFull))
    }

    pub fn patch_i16(&mut self, at: usize, value: i16) -> Result<(), RuntimeError> {
        self.mem
            .write_u16(Segment::Code, at, value as u16)
            .map_err(|e| from_core_error(e, RuntimeError::CodeSegmentFull))
    }

    pub fn code_pos(&self) -> usize {
        self.code_used
    }

    /// Roll the CODE high-water mark back to `to`, abandoning everything
    /// appended since. Used to discard a compile attempt that failed
    /// partway through, once its dictionary entries have also been
    /// forgotten (`dict.forget`) — nothing still reachable points into the
    /// abandoned range.
    pub fn rewind_code(&mut self, to: usize) {
        self.code_used = to;
    }

    /// Reset the data stack, return stack, and instruction pointer to a
    /// clean state. An embedder recovering from an error mid-session (spec
    /// §7: REPL "resets SP/RP/BP and IP ... before returning to the
    /// prompt") calls this between evaluations; it does not touch the
    /// dictionary, digest, or CODE segment.
    pub fn reset_registers(&mut self) {
        self.sp = 0;
        self.rp = 0;
        self.bp = 0;
        self.ip = 0;
        self.running = true;
    }

    /// Intern a string literal, returning the digest id a `PushLiteral`
    /// carrying `Tag::String` should encode. The only way `svm-compiler`
    /// reaches the string segment, since `mem`/`mem_mut` stay crate-private.
    pub fn intern_string(&mut self, s: &str) -> Result<u16, RuntimeError> {
        self.digest.intern(&mut self.mem, s)
    }

    /// Look up a previously interned string by id (debugging/`print`-style
    /// embedding use; `builtins::print` reaches the digest directly since it
    /// already lives inside this crate).
    pub fn lookup_string(&self, id: u16) -> Result<String, RuntimeError> {
        self.digest.lookup(&self.mem, id)
    }

    fn read_code_byte(&mut self) -> Result<u8, RuntimeError> {
        let byte = self.mem.read_byte(Segment::Code, self.ip).map_err(|e| {
            from_core_error(
                e,
                RuntimeError::CompileError {
                    message: "instruction pointer ran past the code segment".into(),
                    line: 0,
                    col: 0,
                },
            )
        })?;
        self.ip += 1;
        Ok(byte)
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    /// Run the fetch/decode/dispatch loop starting at `entry` until either
    /// control returns to the synthetic top-level sentinel or `running` is
    /// cleared by `abort`. `entry` must be the address of an `Enter`
    /// instruction (every compiled unit — colon definition or top-level
    /// chunk alike — is wrapped in `Enter`/`Exit`, so this is never a
    /// special case the compiler has to remember): the sentinel this
    /// pushes plays the same role `call` would have, and `Exit` is what
    /// pops it back off.
    pub fn run(&mut self, entry: usize) -> Result<(), VmError> {
        tracing::trace!(entry, "dispatch loop entered");
        self.ip = entry;
        self.running = true;
        // A top-level invocation has no real caller; the sentinel return
        // address is CODE's capacity, which is never a valid instruction
        // byte for this invocation to land back on other than "we're done".
        let sentinel = self.mem.capacity(Segment::Code) as u32;
        self.push_r(sentinel).map_err(|e| self.wrap(e))?;
        loop {
            if !self.running {
                tracing::trace!(entry, "dispatch loop stopped");
                return Ok(());
            }
            if self.ip as u32 == sentinel {
                self.running = true;
                tracing::trace!(entry, "dispatch loop returned to sentinel");
                return Ok(());
            }
            if let Err(e) = self.step() {
                self.running = false;
                let err = self.wrap(e);
                tracing::warn!(entry, error = %err.kind, "dispatch loop raised an error");
                return Err(err);
            }
        }
    }

    /// A bounded (64-cell) snapshot of the data stack, deepest cell first —
    /// the embedding surface's read-only window onto VM state (spec §6),
    /// and what every raised `VmError` carries.
    pub fn stack_snapshot(&self) -> StackSnapshot {
        let bound = self.depth().min(64);
        let mut cells = Vec::with_capacity(bound);
        for depth in (0..bound).rev() {
            if let Ok(v) = self.peek(depth) {
                cells.push(display_cell(v));
            }
        }
        StackSnapshot(cells)
    }

    fn wrap(&self, kind: RuntimeError) -> VmError {
        VmError {
            kind,
            stack: self.stack_snapshot(),
        }
    }

    /// Execute exactly one instruction.
    fn step(&mut self) -> Result<(), RuntimeError> {
        let byte = self.read_code_byte()?;
        if byte & 0x80 != 0 {
            let lo = self.read_code_byte()?;
            let addr = (((byte & 0x7F) as u32) << 8) | lo as u32;
            return self.call(addr);
        }
        let op = Op::from_u8(byte).ok_or(RuntimeError::CompileError {
            message: format!("unknown opcode byte {byte}"),
            line: 0,
            col: 0,
        })?;
        self.dispatch(op)
    }

    /// Invoke the user-defined word whose prologue (`Enter`) begins at
    /// `addr`: push the return address, jump. `Enter` does the rest (save
    /// BP, reserve locals).
    fn call(&mut self, addr: u32) -> Result<(), RuntimeError> {
        self.push_r(self.ip as u32)?;
        self.ip = addr as usize;
        Ok(())
    }

    /// Invoke any code reference — a user word's address (as `call` would
    /// reach via the 2-byte encoding) or a built-in opcode — and run it to
    /// completion before returning. Used by `eval`, `if-else`, `sort`'s
    /// comparator, and path evaluation in `get`/`set`.
    pub fn invoke(&mut self, value: TaggedValue) -> Result<(), RuntimeError> {
        match value.tag() {
            Tag::Builtin => crate::builtins::dispatch_named(self, value.payload()),
            Tag::Code => self.call_and_run(value.payload() as u32),
            _ => Err(RuntimeError::TypeError {
                context: "eval expects a CODE or BUILTIN reference",
                got: display_cell(value),
            }),
        }
    }

    /// Like `call`, but runs the dispatch loop until control returns to
    /// the instruction right after this call, instead of to a caller
    /// higher up. Used when a built-in (not the main dispatch loop) needs
    /// to execute a quotation and get control back.
    fn call_and_run(&mut self, addr: u32) -> Result<(), RuntimeError> {
        let saved_ip = self.ip;
        let return_sentinel = self.mem.capacity(Segment::Code) as u32;
        self.push_r(return_sentinel)?;
        self.ip = addr as usize;
        loop {
            if self.ip as u32 == return_sentinel {
                self.ip = saved_ip;
                return Ok(());
            }
            self.step()?;
        }
    }

    fn dispatch(&mut self, op: Op) -> Result<(), RuntimeError> {
        match op {
            Op::PushLiteral => {
                let b0 = self.read_code_byte()?;
                let b1 = self.read_code_byte()?;
                let b2 = self.read_code_byte()?;
                let b3 = self.read_code_byte()?;
                let bits = u32::from_le_bytes([b0, b1, b2, b3]);
                self.push(TaggedValue::from_bits(bits))
            }
            Op::Branch => {
                let offset = self.read_i16()?;
                self.ip = (self.ip as isize + offset as isize) as usize;
                Ok(())
            }
            Op::Branch0 => {
                let offset = self.read_i16()?;
                let cond = self.pop()?;
                if !cond.is_truthy() {
                    self.ip = (self.ip as isize + offset as isize) as usize;
                }
                Ok(())
            }
            Op::Enter => {
                let n = self.read_code_byte()? as usize;
                self.push_r(self.bp as u32)?;
                self.bp = self.rp;
                for _ in 0..n {
                    self.push_r(NIL.to_bits())?;
                }
                Ok(())
            }
            Op::Exit => {
                self.rp = self.bp;
                self.bp = self.pop_r()? as usize;
                self.ip = self.pop_r()? as usize;
                Ok(())
            }
            Op::PushLocal => {
                let k = self.read_code_byte()? as usize;
                let bits = self
                    .mem
                    .read_cell(Segment::RStack, self.bp + 4 * k)
                    .map_err(|e| {
                        from_core_error(
                            e,
                            RuntimeError::ValueRangeError {
                                context: "local slot index out of range",
                            },
                        )
                    })?;
                self.push(TaggedValue::from_bits(bits))
            }
            Op::StoreLocal => {
                let k = self.read_code_byte()? as usize;
                let v = self.pop()?;
                self.mem
                    .write_cell(Segment::RStack, self.bp + 4 * k, v.to_bits())
                    .map_err(|e| {
                        from_core_error(
                            e,
                            RuntimeError::ValueRangeError {
                                context: "local slot index out of range",
                            },
                        )
                    })
            }
            Op::Mark => self.push_r((self.sp / 4) as u32),
            Op::EndList => {
                let mark_cells = self.pop_r()? as usize;
                let count = self.sp / 4 - mark_cells;
                let header =
                    TaggedValue::try_encode(Tag::List, count as i64).map_err(|e| {
                        from_core_error(
                            e,
                            RuntimeError::ValueRangeError {
                                context: "list exceeds the maximum slot count",
                            },
                        )
                    })?;
                self.push(header)
            }
            _ => crate::builtins::dispatch(self, op),
        }
    }

    fn read_i16(&mut self) -> Result<i16, RuntimeError> {
        let b0 = self.read_code_byte()?;
        let b1 = self.read_code_byte()?;
        Ok(u16::from_le_bytes([b0, b1]) as i16)
    }
}
