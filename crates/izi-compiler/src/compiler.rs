//! The single-pass Pratt compiler: drives the scanner, parses with a
//! precedence table, and emits bytecode directly into a `Chunk` as it goes.
//! There is no intermediate AST — by the time a production is recognized,
//! its bytecode has already been written.

use std::rc::Rc;

use izi_core::{Function, OpCode, Value, MAX_LOCALS, MAX_UPVALUES};

use crate::error::{CompileError, Diagnostic};
use crate::scanner::{Scanner, Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Constructor,
}

struct Local {
    name: String,
    /// -1 means "declared but not yet initialized" (the name is visible to
    /// `resolveLocal` for shadowing checks but not yet readable).
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueInfo {
    index: u8,
    is_local: bool,
}

/// Per-function compile state. Nested function compilation pushes one of
/// these and pops it when the function body is done; the stack models what
/// would otherwise be a chain of enclosing-compiler references.
struct FunctionScope {
    function: Function,
    function_type: FunctionType,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueInfo>,
    scope_depth: i32,
}

impl FunctionScope {
    fn new(name: Rc<str>, function_type: FunctionType) -> Self {
        // Slot 0 is reserved: the receiver for methods/constructors, an
        // unnamed placeholder otherwise.
        let slot0_name = match function_type {
            FunctionType::Method | FunctionType::Constructor => "this".to_string(),
            _ => String::new(),
        };
        FunctionScope {
            function: Function::new(name),
            function_type,
            locals: vec![Local {
                name: slot0_name,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassScope {
    has_superclass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Conditional,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Conditional,
            Conditional => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

/// Static, token-kind-indexed precedence table. `PREC_CONDITIONAL` exists
/// in the precedence ladder but, as in the reference scanner (which lexes
/// `?`/`:` tokens that no rule ever fires on), no grammar production is
/// wired to it — there is no ternary operator here.
fn get_rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    let rule = |prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence| ParseRule {
        prefix,
        infix,
        precedence,
    };
    match kind {
        LeftParen => rule(Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        Dot => rule(None, Some(Compiler::dot), Precedence::Call),
        Minus => rule(Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => rule(None, Some(Compiler::binary), Precedence::Term),
        Slash => rule(None, Some(Compiler::binary), Precedence::Factor),
        Star => rule(None, Some(Compiler::binary), Precedence::Factor),
        Bang => rule(Some(Compiler::unary), None, Precedence::None),
        BangEqual => rule(None, Some(Compiler::binary), Precedence::Equality),
        EqualEqual => rule(None, Some(Compiler::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            rule(None, Some(Compiler::binary), Precedence::Comparison)
        }
        Identifier => rule(Some(Compiler::variable), None, Precedence::None),
        String => rule(Some(Compiler::string), None, Precedence::None),
        Number => rule(Some(Compiler::number), None, Precedence::None),
        And => rule(None, Some(Compiler::and_), Precedence::And),
        Or => rule(None, Some(Compiler::or_), Precedence::Or),
        False | True | Nil => rule(Some(Compiler::literal), None, Precedence::None),
        This => rule(Some(Compiler::this_), None, Precedence::None),
        Super => rule(Some(Compiler::super_), None, Precedence::None),
        _ => rule(None, None, Precedence::None),
    }
}

/// The compiler. Owns the scanner and the shared source buffer; tokens
/// never borrow with a lifetime tied to a stack frame, since the buffer
/// outlives the whole compile and tokens carry only `(start, length)`.
pub struct Compiler {
    source: Rc<str>,
    scanner: Scanner,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    functions: Vec<FunctionScope>,
    classes: Vec<ClassScope>,
}

/// Compile a complete source file into its top-level `Function`.
///
/// Consumes the whole input to completion even after the first error, so
/// that as many diagnostics as possible are surfaced in one pass; on any
/// error the collected diagnostics are returned and no `Function` is
/// produced.
pub fn compile(source: &str) -> Result<Rc<Function>, CompileError> {
    let source: Rc<str> = Rc::from(source);
    let mut compiler = Compiler::new(source);

    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }

    let scope = compiler.end_compiler();
    if compiler.had_error {
        Err(CompileError {
            diagnostics: compiler.diagnostics,
        })
    } else {
        Ok(Rc::new(scope.function))
    }
}

impl Compiler {
    fn new(source: Rc<str>) -> Self {
        let scanner = Scanner::new(source.clone());
        let placeholder = Token::synthetic();
        let mut compiler = Compiler {
            source,
            scanner,
            previous: placeholder.clone(),
            current: placeholder,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            functions: vec![FunctionScope::new(Rc::from(""), FunctionType::Script)],
            classes: Vec::new(),
        };
        compiler.advance();
        compiler
    }

    // -- token stream -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if !self.current.is_error() {
                break;
            }
            let message = self.current.text(&self.source).to_string();
            self.error_at_current(&message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // -- diagnostics --------------------------------------------------------

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let lexeme = if token.kind == TokenKind::Eof {
            "end".to_string()
        } else {
            token.text(&self.source).to_string()
        };
        self.diagnostics.push(Diagnostic {
            line: token.line,
            lexeme,
            message: message.to_string(),
        });
        self.had_error = true;
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- emission -----------------------------------------------------------

    fn current_chunk(&mut self) -> &mut izi_core::Chunk {
        &mut self.functions.last_mut().unwrap().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.as_u8());
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_byte(op.as_u8());
        self.emit_byte(byte);
    }

    fn emit_constant(&mut self, value: Value) {
        match self.current_chunk().add_constant(value) {
            Ok(idx) => self.emit_op_byte(OpCode::Constant, idx),
            Err(message) => self.error(&message),
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let bytes = (jump as u16).to_be_bytes();
        self.current_chunk().patch_byte(offset, bytes[0]);
        self.current_chunk().patch_byte(offset + 1, bytes[1]);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
            return;
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    fn emit_return(&mut self) {
        if self.functions.last().unwrap().function_type == FunctionType::Constructor {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn end_compiler(&mut self) -> FunctionScope {
        self.emit_return();
        self.functions.pop().unwrap()
    }

    // -- scopes and locals ----------------------------------------------------

    fn begin_scope(&mut self) {
        self.functions.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let to_close: Vec<bool> = {
            let func = self.functions.last_mut().unwrap();
            func.scope_depth -= 1;
            let depth = func.scope_depth;
            let mut closed = Vec::new();
            while let Some(local) = func.locals.last() {
                if local.depth > depth {
                    closed.push(func.locals.pop().unwrap().is_captured);
                } else {
                    break;
                }
            }
            closed
        };
        for captured in to_close {
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        match self.current_chunk().add_constant(Value::Str(Rc::from(name))) {
            Ok(idx) => idx,
            Err(message) => {
                self.error(&message);
                0
            }
        }
    }

    fn add_local(&mut self, name: String) {
        let func = self.functions.last_mut().unwrap();
        if func.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        func.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.functions.last().unwrap().scope_depth == 0 {
            return;
        }
        let name = self.previous.text(&self.source).to_string();
        let duplicate = {
            let func = self.functions.last().unwrap();
            let depth = func.scope_depth;
            let mut found = false;
            for local in func.locals.iter().rev() {
                if local.depth != -1 && local.depth < depth {
                    break;
                }
                if local.name == name {
                    found = true;
                    break;
                }
            }
            found
        };
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.functions.last().unwrap().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.text(&self.source).to_string();
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        let func = self.functions.last_mut().unwrap();
        if func.scope_depth == 0 {
            return;
        }
        let depth = func.scope_depth;
        if let Some(local) = func.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.functions.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, func_idx: usize, name: &str) -> Option<u8> {
        let found = {
            let locals = &self.functions[func_idx].locals;
            let mut result = None;
            for (i, local) in locals.iter().enumerate().rev() {
                if local.name == name {
                    result = Some((i as u8, local.depth));
                    break;
                }
            }
            result
        };
        match found {
            Some((slot, depth)) => {
                if depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                    None
                } else {
                    Some(slot)
                }
            }
            None => None,
        }
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> Option<u8> {
        if func_idx == 0 {
            return None;
        }
        let enclosing = func_idx - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(func_idx, local_slot, true));
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(func_idx, upvalue_slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, func_idx: usize, index: u8, is_local: bool) -> u8 {
        {
            let existing = &self.functions[func_idx].upvalues;
            for (i, uv) in existing.iter().enumerate() {
                if uv.index == index && uv.is_local == is_local {
                    return i as u8;
                }
            }
        }
        if self.functions[func_idx].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let func = &mut self.functions[func_idx];
        func.upvalues.push(UpvalueInfo { index, is_local });
        let count = func.upvalues.len();
        func.function.upvalue_count = count;
        (count - 1) as u8
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let func_idx = self.functions.len() - 1;
        let (get_op, set_op, slot) = if let Some(slot) = self.resolve_local(func_idx, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(func_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let slot = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, slot)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, slot);
        } else {
            self.emit_op_byte(get_op, slot);
        }
    }

    // -- Pratt parsing --------------------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix_rule = match get_rule(self.previous.kind).prefix {
            Some(rule) => rule,
            None => {
                self.error("Expect expression.");
                return;
            }
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            let infix_rule = get_rule(self.previous.kind).infix.unwrap();
            infix_rule(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule only registered for - and !"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let rule = get_rule(op_kind);
        self.parse_precedence(rule.precedence.next());

        match op_kind {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary rule only registered for arithmetic/comparison tokens"),
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let text = self.previous.text(&self.source).to_string();
        let value: f64 = text.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let owned = {
            let text = self.previous.text(&self.source);
            text[1..text.len() - 1].to_string()
        };
        self.emit_constant(Value::Str(Rc::from(owned.as_str())));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal rule only registered for false/true/nil"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.text(&self.source).to_string();
        self.named_variable(&name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.text(&self.source).to_string();
        let name_const = self.identifier_constant(&name);

        self.named_variable("this", false);
        self.named_variable("super", false);
        self.emit_op_byte(OpCode::GetSuper, name_const);
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.text(&self.source).to_string();
        let name_const = self.identifier_constant(&name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name_const);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name_const);
        }
    }

    // -- declarations and statements -----------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Import) {
            self.import_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.text(&self.source).to_string();
        let name_const = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit_op_byte(OpCode::Class, name_const);
        self.define_variable(name_const);

        self.classes.push(ClassScope {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.text(&self.source).to_string();
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.variable(false);

            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(&class_name, false);

        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }

        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = self.previous.text(&self.source).to_string();
        let name_const = self.identifier_constant(&method_name);

        let function_type = if method_name == "new" {
            FunctionType::Constructor
        } else {
            FunctionType::Method
        };
        self.function(function_type, Rc::from(method_name.as_str()));
        self.emit_op_byte(OpCode::Method, name_const);
    }

    fn function(&mut self, function_type: FunctionType, name: Rc<str>) {
        self.functions.push(FunctionScope::new(name, function_type));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                {
                    let func = self.functions.last_mut().unwrap();
                    func.function.arity += 1;
                    if func.function.arity > 255 {
                        self.error_at_current("Can't have more than 255 parameters.");
                    }
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let scope = self.end_compiler();
        let upvalues = scope.upvalues.clone();
        let function = Rc::new(scope.function);

        let const_idx = match self.current_chunk().add_constant(Value::Function(function)) {
            Ok(idx) => idx,
            Err(message) => {
                self.error(&message);
                0
            }
        };
        self.emit_op_byte(OpCode::Closure, const_idx);
        for uv in upvalues {
            self.emit_byte(if uv.is_local { 1 } else { 0 });
            self.emit_byte(uv.index);
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        let name = self.previous.text(&self.source).to_string();
        self.function(FunctionType::Function, Rc::from(name.as_str()));
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn import_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect module name after 'import'.");
        let name = self.previous.text(&self.source).to_string();
        let name_const = self.identifier_constant(&name);
        self.consume(TokenKind::Semicolon, "Expect ';' after import.");
        self.emit_op_byte(OpCode::Import, name_const);
        self.emit_op(OpCode::Pop);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        let function_type = self.functions.last().unwrap().function_type;
        if function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if function_type == FunctionType::Constructor {
                self.error("Can't return a value from a constructor.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    /// `switch (expr) { case E: stmts... default: stmts... }`. The switch
    /// value is evaluated once and left on the stack for the whole
    /// construct; every case guard `DUP`s it for comparison and the final
    /// `POP` (after the loop) discards the original.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch body.");

        if !self.check(TokenKind::Case)
            && !self.check(TokenKind::Default)
            && !self.check(TokenKind::RightBrace)
        {
            self.error("Expect 'case' or 'default' before statements in switch body.");
        }

        let mut case_ends: Vec<usize> = Vec::new();
        let mut pending_skip: Option<usize> = None;
        let mut seen_default = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Case) {
                if seen_default {
                    self.error("Can't have a case after the default case.");
                }
                if let Some(skip) = pending_skip.take() {
                    self.patch_jump(skip);
                    self.emit_op(OpCode::Pop);
                }

                self.emit_op(OpCode::Dup);
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after case value.");
                self.emit_op(OpCode::Equal);
                let next_skip = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_op(OpCode::Pop);

                while !self.check(TokenKind::Case)
                    && !self.check(TokenKind::Default)
                    && !self.check(TokenKind::RightBrace)
                    && !self.check(TokenKind::Eof)
                {
                    self.statement();
                }

                case_ends.push(self.emit_jump(OpCode::Jump));
                pending_skip = Some(next_skip);
            } else if self.match_token(TokenKind::Default) {
                if seen_default {
                    self.error("Can't have more than one default case.");
                }
                if let Some(skip) = pending_skip.take() {
                    self.patch_jump(skip);
                    self.emit_op(OpCode::Pop);
                }
                seen_default = true;
                self.consume(TokenKind::Colon, "Expect ':' after 'default'.");

                while !self.check(TokenKind::Case)
                    && !self.check(TokenKind::Default)
                    && !self.check(TokenKind::RightBrace)
                    && !self.check(TokenKind::Eof)
                {
                    self.statement();
                }

                if self.check(TokenKind::Case) {
                    self.error("Expect '}' after default case.");
                }
            } else {
                self.error("Expect 'case' or 'default'.");
                self.advance();
            }
        }

        if let Some(skip) = pending_skip.take() {
            self.patch_jump(skip);
            self.emit_op(OpCode::Pop);
        }

        self.consume(TokenKind::RightBrace, "Expect '}' after switch body.");

        for end in case_ends {
            self.patch_jump(end);
        }

        self.emit_op(OpCode::Pop);
    }
}
