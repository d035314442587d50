//! Single-pass parser / bytecode emitter (spec §4.9, §4.10)
//!
//! There is no AST stage: every token is turned into bytecode (or a
//! dictionary entry, or a patched jump) the moment it's read. `Compiler`
//! holds nothing but the token stream, a cursor into it, and — while a
//! colon definition is open — the name-to-slot map for its local
//! variables.
//!
//! Local variables have no syntax in spec.md; this core resolves that open
//! question with a Forth-style `{: a b :}` header (declares locals, pops
//! the incoming arguments into them, rightmost name gets the top of
//! stack) plus a mid-body `-> name` that introduces-or-reassigns one more.
//! A quotation's body gets its own empty locals frame: it cannot see its
//! enclosing definition's locals, since `eval` runs it under a fresh `BP`
//! (no closure capture — see DESIGN.md).

use svm_core::value::{Tag, TaggedValue};
use svm_runtime::{Binding, Op, RuntimeError, Vm};

use crate::lexer::{self, Lexeme, Token};

enum Terminator {
    Eof,
    Token(&'static str),
}

struct Compiler<'vm> {
    vm: &'vm mut Vm,
    tokens: Vec<Token>,
    pos: usize,
    /// `Some` while compiling a colon definition's body: the locals
    /// declared so far, in slot order. `None` at top level and while
    /// compiling a quotation (quotations get an isolated, always-empty
    /// frame — see module docs).
    locals: Option<Vec<String>>,
    last_line: usize,
    last_col: usize,
}

/// Compile `source` as one top-level chunk — everything but the colon
/// definitions it contains folds into a single `Enter 0 ... Exit` unit
/// whose address is returned; `vm.run(entry)` executes it. Colon
/// definitions compiled along the way get their own separate code range
/// and a dictionary entry; they do not run until called.
pub fn compile_str(vm: &mut Vm, source: &str) -> Result<usize, RuntimeError> {
    let tokens = lexer::tokenize(source);
    let mut compiler = Compiler {
        vm,
        tokens,
        pos: 0,
        locals: None,
        last_line: 0,
        last_col: 0,
    };

    let entry = compiler.vm.code_pos();
    compiler.vm.emit_byte(Op::Enter as u8)?;
    compiler.vm.emit_byte(0)?;
    compiler.compile_block(Terminator::Eof)?;
    compiler.vm.emit_byte(Op::Exit as u8)?;
    Ok(entry)
}

impl<'vm> Compiler<'vm> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if let Some(t) = &tok {
            self.last_line = t.line;
            self.last_col = t.col;
            self.pos += 1;
        }
        tok
    }

    fn parse_error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::ParseError {
            message: message.into(),
            line: self.last_line,
            col: self.last_col,
        }
    }

    fn compile_error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::CompileError {
            message: message.into(),
            line: self.last_line,
            col: self.last_col,
        }
    }

    /// Compile statements until `terminator` is reached (and consumed), or
    /// EOF for `Terminator::Eof`.
    fn compile_block(&mut self, terminator: Terminator) -> Result<(), RuntimeError> {
        loop {
            let Some(tok) = self.peek() else {
                return match terminator {
                    Terminator::Eof => Ok(()),
                    Terminator::Token(t) => {
                        Err(self.parse_error(format!("unexpected end of input, expected '{t}'")))
                    }
                };
            };
            if let Terminator::Token(t) = terminator {
                if tok.text == t {
                    self.advance();
                    return Ok(());
                }
            }
            self.compile_statement()?;
        }
    }

    fn compile_statement(&mut self) -> Result<(), RuntimeError> {
        let tok = self.advance().expect("caller already confirmed a token");
        let text = tok.text;
        match text.as_str() {
            ":" => self.compile_colon_def(),
            "{" => self.compile_quotation(),
            "->" => self.compile_store_local(),
            _ => self.compile_atom(&text),
        }
    }

    fn compile_atom(&mut self, text: &str) -> Result<(), RuntimeError> {
        if let Some(idx) = self.current_local(text) {
            self.vm.emit_byte(Op::PushLocal as u8)?;
            self.vm.emit_byte(idx as u8)?;
            return Ok(());
        }
        match lexer::classify(text).map_err(|m| self.parse_error(m))? {
            Lexeme::Integer(n) => {
                let v = TaggedValue::from_integer(n).unwrap_or_else(|_| TaggedValue::from_float(n as f32));
                self.emit_literal(v)
            }
            Lexeme::Float(f) => self.emit_literal(TaggedValue::from_float(f)),
            Lexeme::Str(s) => {
                let id = self.vm.intern_string(&s)?;
                self.emit_literal(TaggedValue::encode(Tag::String, id))
            }
            Lexeme::Symbol(name) => {
                let id = self.vm.intern_string(name)?;
                self.emit_literal(TaggedValue::encode(Tag::String, id))
            }
            Lexeme::Word(name) => self.compile_word(name),
        }
    }

    fn emit_literal(&mut self, v: TaggedValue) -> Result<(), RuntimeError> {
        self.vm.emit_byte(Op::PushLiteral as u8)?;
        self.vm.emit_bytes(&v.to_bits().to_le_bytes())?;
        Ok(())
    }

    fn compile_word(&mut self, name: &str) -> Result<(), RuntimeError> {
        let entry = self
            .vm
            .dict
            .lookup(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedWord { name: name.to_string() })?;

        if entry.immediate {
            let reference = match entry.binding {
                Binding::Builtin(op) => TaggedValue::encode(Tag::Builtin, op as u16),
                Binding::Code(addr) => TaggedValue::encode(Tag::Code, addr as u16),
            };
            return self.vm.invoke(reference);
        }

        match entry.binding {
            Binding::Builtin(op) => {
                self.vm.emit_byte(op)?;
            }
            Binding::Code(addr) => {
                if addr > 0x7FFF {
                    return Err(self.compile_error(format!(
                        "word '{name}' address {addr} exceeds the 15-bit call range"
                    )));
                }
                let addr = addr as u16;
                self.vm.emit_byte(0x80 | ((addr >> 8) as u8))?;
                self.vm.emit_byte((addr & 0xFF) as u8)?;
            }
        }
        Ok(())
    }

    fn current_local(&self, name: &str) -> Option<usize> {
        self.locals.as_ref()?.iter().position(|n| n == name)
    }

    /// `: name ... ;` — see spec §4.9. The dictionary entry is defined
    /// before the body compiles, so a definition may call itself.
    fn compile_colon_def(&mut self) -> Result<(), RuntimeError> {
        if self.locals.is_some() {
            return Err(self.compile_error("colon definitions cannot nest"));
        }
        let name = self
            .advance()
            .ok_or_else(|| self.parse_error("expected a name after ':'"))?
            .text;

        let branch_at = self.vm.emit_byte(Op::Branch as u8)?;
        self.vm.emit_bytes(&[0, 0])?;
        let enter_at = self.vm.code_pos();
        self.vm.dict.define_code(name.clone(), enter_at as u32, false)?;
        self.vm.emit_byte(Op::Enter as u8)?;
        let n_at = self.vm.emit_byte(0)?;

        self.locals = Some(Vec::new());
        if matches!(self.peek(), Some(t) if t.text == "{:") {
            self.advance();
            self.compile_locals_header()?;
        }

        let body = self.compile_block(Terminator::Token(";"));
        let locals = self.locals.take().unwrap_or_default();
        body?;
        self.vm.emit_byte(Op::Exit as u8)?;

        if locals.len() > u8::MAX as usize {
            return Err(self.compile_error(format!(
                "word '{name}' declares more than {} locals",
                u8::MAX
            )));
        }
        self.vm.patch_u8(n_at, locals.len() as u8)?;
        let after = self.vm.code_pos();
        self.vm
            .patch_i16(branch_at + 1, (after - (branch_at + 3)) as i16)?;
        Ok(())
    }

    /// `{: a b :}` right after the prologue: declare `a`, `b` as locals 0
    /// and 1, and pop the two incoming arguments into them — `b` (the
    /// rightmost name) is TOS, matching the order they'd have been pushed
    /// in by the caller.
    fn compile_locals_header(&mut self) -> Result<(), RuntimeError> {
        let mut names = Vec::new();
        loop {
            let tok = self
                .advance()
                .ok_or_else(|| self.parse_error("unterminated '{:' locals header"))?;
            if tok.text == ":}" {
                break;
            }
            names.push(tok.text);
        }
        let locals = self.locals.as_mut().expect("locals frame active in a colon def");
        locals.extend(names.iter().cloned());
        for idx in (0..names.len()).rev() {
            self.vm.emit_byte(Op::StoreLocal as u8)?;
            self.vm.emit_byte((locals.len() - names.len() + idx) as u8)?;
        }
        Ok(())
    }

    /// `-> name`: pop TOS into `name`, declaring it as a new local slot the
    /// first time it's seen.
    fn compile_store_local(&mut self) -> Result<(), RuntimeError> {
        let locals = self
            .locals
            .as_mut()
            .ok_or_else(|| self.compile_error("'->' is only valid inside a colon definition"))?;
        let name = self
            .advance()
            .ok_or_else(|| self.parse_error("expected a local name after '->'"))?
            .text;
        let idx = match locals.iter().position(|n| n == &name) {
            Some(i) => i,
            None => {
                locals.push(name);
                locals.len() - 1
            }
        };
        if idx > u8::MAX as usize {
            return Err(self.compile_error(format!("more than {} locals declared", u8::MAX)));
        }
        self.vm.emit_byte(Op::StoreLocal as u8)?;
        self.vm.emit_byte(idx as u8)?;
        Ok(())
    }

    /// `{ ... }` — emits a branch over the body, the body itself (wrapped
    /// in its own `Enter 0`/`Exit` — every callable unit is, per
    /// `svm_runtime::vm`'s own convention), then pushes a CODE-tagged
    /// reference to the body's start. `eval` is what later enters it.
    fn compile_quotation(&mut self) -> Result<(), RuntimeError> {
        let branch_at = self.vm.emit_byte(Op::Branch as u8)?;
        self.vm.emit_bytes(&[0, 0])?;
        let body_entry = self.vm.code_pos();
        self.vm.emit_byte(Op::Enter as u8)?;
        self.vm.emit_byte(0)?;

        let saved_locals = self.locals.take();
        let body = self.compile_block(Terminator::Token("}"));
        self.locals = saved_locals;
        body?;

        self.vm.emit_byte(Op::Exit as u8)?;
        let after = self.vm.code_pos();
        self.vm
            .patch_i16(branch_at + 1, (after - (branch_at + 3)) as i16)?;

        if body_entry > 0xFFFF {
            return Err(self.compile_error("quotation body address exceeds 16 bits"));
        }
        self.emit_literal(TaggedValue::encode(Tag::Code, body_entry as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svm_runtime::VmConfig;

    fn run(source: &str) -> Vm {
        let mut vm = Vm::new(VmConfig::default());
        let entry = compile_str(&mut vm, source).unwrap();
        vm.run(entry).unwrap();
        vm
    }

    #[test]
    fn arithmetic_scenario() {
        let mut vm = run("2 3 + 4 *");
        assert_eq!(vm.pop().unwrap().as_float(), 20.0);
    }

    #[test]
    fn list_literal_builds_a_list_header() {
        let mut vm = run("( 1 2 3 )");
        let header = vm.pop().unwrap();
        assert_eq!(header.tag(), Tag::List);
        assert_eq!(header.payload(), 3);
    }

    #[test]
    fn nested_list_literal() {
        let mut vm = run("( 1 ( 2 3 ) 4 )");
        let header = vm.pop().unwrap();
        assert_eq!(header.tag(), Tag::List);
        assert_eq!(header.payload(), 5); // 1 + (2 payload + 1 header) + 1
    }

    #[test]
    fn colon_definition_and_call() {
        let mut vm = run(": sq dup * ; 7 sq");
        assert_eq!(vm.pop().unwrap().as_float(), 49.0);
    }

    #[test]
    fn quotation_and_eval() {
        let mut vm = run("3 { dup * } eval");
        assert_eq!(vm.pop().unwrap().as_float(), 9.0);
    }

    #[test]
    fn locals_header_binds_rightmost_to_tos() {
        // a is the deeper argument, b is TOS; body returns a - b.
        let mut vm = run(": sub2 {: a b :} a b - ; 10 3 sub2");
        assert_eq!(vm.pop().unwrap().as_float(), 7.0);
    }

    #[test]
    fn store_local_introduces_a_new_slot() {
        let mut vm = run(": f -> x x x * ; 5 f");
        assert_eq!(vm.pop().unwrap().as_float(), 25.0);
    }

    #[test]
    fn recursive_definition_can_call_itself() {
        // The argument rides the data stack through the recursion, since a
        // quotation's body can't see its enclosing definition's locals.
        let mut vm = run(
            ": count-down dup 0 = { } { 1 - count-down } if-else ; 3 count-down",
        );
        assert_eq!(vm.pop().unwrap().as_float(), 0.0);
    }

    #[test]
    fn undefined_word_is_a_compile_error() {
        let mut vm = Vm::new(VmConfig::default());
        let err = compile_str(&mut vm, "totally-not-a-word").unwrap_err();
        assert!(matches!(err, RuntimeError::UndefinedWord { .. }));
    }

    #[test]
    fn unterminated_quotation_is_a_parse_error() {
        let mut vm = Vm::new(VmConfig::default());
        let err = compile_str(&mut vm, "3 { dup *").unwrap_err();
        assert!(matches!(err, RuntimeError::ParseError { .. }));
    }

    #[test]
    fn quotation_cannot_see_enclosing_locals() {
        let mut vm = Vm::new(VmConfig::default());
        let err = compile_str(&mut vm, ": f {: a :} { a } eval ;").unwrap_err();
        assert!(matches!(err, RuntimeError::UndefinedWord { name } if name == "a"));
    }

    #[test]
    fn arrow_outside_colon_def_is_a_compile_error() {
        let mut vm = Vm::new(VmConfig::default());
        let err = compile_str(&mut vm, "-> x").unwrap_err();
        assert!(matches!(err, RuntimeError::CompileError { .. }));
    }
}
