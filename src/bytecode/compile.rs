use crate::bytecode::{CompileError, Op, Program};
use crate::error::ScriptError;
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};

/// Single-pass recursive-descent compiler.
///
/// Consumes tokens straight from the lexer and emits instructions as it goes;
/// there is no intermediate tree. Forward jumps are emitted with a placeholder
/// target and patched once the destination index is known. Identifiers
/// resolve to local slots first (inside a function body), then to global
/// slots; native-function names occupy the lowest global slots.
pub struct Compiler {
    global: bool,
    global_vars: Vec<String>,
    local_vars: Vec<String>,
    string_table: Vec<String>,
    binary_operators: Vec<Vec<(TokenKind, Op)>>,
    ops: Vec<Op>,
}

impl Compiler {
    pub fn new() -> Self {
        // Lowest to highest precedence; all levels parse right-associatively.
        let binary_operators = vec![
            vec![(TokenKind::LogicalOr, Op::Or)],
            vec![(TokenKind::LogicalAnd, Op::And)],
            vec![(TokenKind::Pipe, Op::BitOr)],
            vec![(TokenKind::Caret, Op::BitXor)],
            vec![(TokenKind::Ampersand, Op::BitAnd)],
            vec![
                (TokenKind::EqualEqual, Op::Eq),
                (TokenKind::NotEqual, Op::Ne),
            ],
            vec![
                (TokenKind::Less, Op::Lt),
                (TokenKind::LessEqual, Op::Le),
                (TokenKind::Greater, Op::Gt),
                (TokenKind::GreaterEqual, Op::Ge),
            ],
            vec![
                (TokenKind::ShiftLeft, Op::Shl),
                (TokenKind::ShiftRight, Op::Shr),
            ],
            vec![(TokenKind::Plus, Op::Add), (TokenKind::Minus, Op::Sub)],
            vec![
                (TokenKind::Star, Op::Mul),
                (TokenKind::Slash, Op::Div),
                (TokenKind::Percent, Op::Rem),
            ],
        ];
        Compiler {
            global: true,
            global_vars: Vec::new(),
            local_vars: Vec::new(),
            string_table: Vec::new(),
            binary_operators,
            ops: Vec::new(),
        }
    }

    /// Registered native-function names become the lowest global slots, in
    /// registration order, so script code can reference them like globals.
    pub fn set_native_functions<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            self.global_vars.push(name.to_string());
        }
    }

    pub fn compile(mut self, lexer: &mut Lexer) -> Result<Program, ScriptError> {
        self.global = true;
        self.parse_block(lexer, 0)?;
        Ok(Program {
            ops: self.ops,
            string_table: self.string_table,
        })
    }

    /// A block is a maximal run of statements sharing one indentation level.
    /// The first statement fixes the level; deeper statements are an error,
    /// shallower ones end the block without consuming the token.
    fn parse_block(&mut self, lexer: &mut Lexer, minimal_indent: usize) -> Result<(), ScriptError> {
        let mut block_indent: Option<usize> = None;
        loop {
            let token = lexer.peek()?.clone();
            match token.kind {
                TokenKind::EndOfFile => break,
                TokenKind::EndOfLine => {
                    lexer.next()?;
                    continue;
                }
                _ => {}
            }
            let indent = match block_indent {
                Some(indent) => indent,
                None => {
                    if token.indent < minimal_indent {
                        return Err(CompileError::at(
                            &token,
                            format!(
                                "no proper indentation (got: {}, expected: {})",
                                token.indent, minimal_indent
                            ),
                        )
                        .into());
                    }
                    block_indent = Some(token.indent);
                    token.indent
                }
            };
            if token.indent > indent {
                return Err(CompileError::at(
                    &token,
                    format!(
                        "inconsistent indentation (got: {}, expected: {})",
                        token.indent, indent
                    ),
                )
                .into());
            }
            if token.indent < indent {
                break;
            }
            if token.kind != TokenKind::Name {
                return Err(CompileError::at(&token, format!("unexpected: {}", token)).into());
            }
            match token.text.as_str() {
                "if" => self.parse_if(lexer, indent)?,
                "while" => self.parse_while(lexer, indent)?,
                "for" => self.parse_for(lexer, indent)?,
                "var" => self.parse_var(lexer)?,
                "function" => self.parse_function(lexer, &token, indent)?,
                "return" => {
                    if self.global {
                        return Err(
                            CompileError::at(&token, "return outside of a function").into()
                        );
                    }
                    lexer.next()?;
                    self.parse_expression(lexer)?;
                    self.expect(lexer, TokenKind::EndOfLine)?;
                    self.ops.push(Op::Return);
                }
                _ => self.parse_statement(lexer, true)?,
            }
        }
        Ok(())
    }

    fn parse_if(&mut self, lexer: &mut Lexer, indent: usize) -> Result<(), ScriptError> {
        lexer.next()?;
        self.parse_expression(lexer)?;
        self.ops.push(Op::JumpIfZero(0));
        let jump_index = self.ops.len() - 1;
        self.expect(lexer, TokenKind::Colon)?;
        self.expect(lexer, TokenKind::EndOfLine)?;
        self.parse_block(lexer, indent + 1)?;
        self.patch_jump(jump_index);
        Ok(())
    }

    fn parse_while(&mut self, lexer: &mut Lexer, indent: usize) -> Result<(), ScriptError> {
        lexer.next()?;
        let loop_top = self.ops.len() as u32;
        self.parse_expression(lexer)?;
        self.ops.push(Op::JumpIfZero(0));
        let jump_index = self.ops.len() - 1;
        self.expect(lexer, TokenKind::Colon)?;
        self.expect(lexer, TokenKind::EndOfLine)?;
        self.parse_block(lexer, indent + 1)?;
        self.ops.push(Op::Jump(loop_top));
        self.patch_jump(jump_index);
        Ok(())
    }

    /// `for INIT; COND; STEP:` compiles to
    ///
    /// ```text
    ///   INIT
    /// cond: COND
    ///   JUMP ZERO -> end
    ///   JUMP -> body
    /// step: STEP
    ///   JUMP -> cond
    /// body: BLOCK
    ///   JUMP -> step
    /// end:
    /// ```
    fn parse_for(&mut self, lexer: &mut Lexer, indent: usize) -> Result<(), ScriptError> {
        lexer.next()?;
        self.parse_statement(lexer, false)?;
        self.expect(lexer, TokenKind::Semicolon)?;
        let cond_top = self.ops.len() as u32;
        self.parse_expression(lexer)?;
        self.ops.push(Op::JumpIfZero(0));
        let jump_to_end = self.ops.len() - 1;
        self.ops.push(Op::Jump(0));
        let jump_past_step = self.ops.len() - 1;
        let step_top = self.ops.len() as u32;
        self.expect(lexer, TokenKind::Semicolon)?;
        self.parse_statement(lexer, false)?;
        self.expect(lexer, TokenKind::Colon)?;
        self.ops.push(Op::Jump(cond_top));
        self.patch_jump(jump_past_step);
        self.expect(lexer, TokenKind::EndOfLine)?;
        self.parse_block(lexer, indent + 1)?;
        self.ops.push(Op::Jump(step_top));
        self.patch_jump(jump_to_end);
        Ok(())
    }

    fn parse_var(&mut self, lexer: &mut Lexer) -> Result<(), ScriptError> {
        lexer.next()?;
        let name_token = self.expect(lexer, TokenKind::Name)?;
        let var_name = name_token.text.clone();
        let slot = if self.global {
            self.add_global(&name_token, &var_name)?
        } else {
            if self.local_vars.iter().any(|v| v == &var_name) {
                return Err(CompileError::at(
                    &name_token,
                    format!("duplicate local variable definition: {}", var_name),
                )
                .into());
            }
            self.local_vars.push(var_name);
            let count = self.local_vars.len() as u32;
            // Merge consecutive declarations into one EnsureLocals.
            if let Some(Op::EnsureLocals(n)) = self.ops.last_mut() {
                *n = count;
            } else {
                self.ops.push(Op::EnsureLocals(count));
            }
            count - 1
        };
        if lexer.peek()?.kind == TokenKind::Assign {
            lexer.next()?;
            self.parse_expression(lexer)?;
            if self.global {
                self.ops.push(Op::AssignGlobal(slot));
            } else {
                self.ops.push(Op::AssignLocal(slot));
            }
        }
        self.expect(lexer, TokenKind::EndOfLine)?;
        Ok(())
    }

    /// The function's global slot is reserved before the body compiles, so
    /// the body can call it recursively. The body is skipped over by a jump
    /// at run time; the function value is assigned after it.
    fn parse_function(
        &mut self,
        lexer: &mut Lexer,
        token: &Token,
        indent: usize,
    ) -> Result<(), ScriptError> {
        if !self.global {
            return Err(CompileError::at(
                token,
                "function definition inside function definition not allowed",
            )
            .into());
        }
        lexer.next()?;
        let name_token = self.expect(lexer, TokenKind::Name)?;
        let function_name = name_token.text.clone();
        self.local_vars.clear();
        self.expect(lexer, TokenKind::LeftParen)?;
        if lexer.peek()?.kind == TokenKind::Name {
            loop {
                let parameter = self.expect(lexer, TokenKind::Name)?;
                self.local_vars.push(parameter.text);
                if lexer.peek()?.kind == TokenKind::RightParen {
                    break;
                }
                self.expect(lexer, TokenKind::Comma)?;
            }
        }
        self.expect(lexer, TokenKind::RightParen)?;
        self.expect(lexer, TokenKind::Colon)?;
        self.expect(lexer, TokenKind::EndOfLine)?;
        let jump_index = self.ops.len();
        let function_slot = self.add_global(&name_token, &function_name)?;
        self.ops.push(Op::Jump(0));
        self.global = false;
        self.ops.push(Op::EnsureLocals(self.local_vars.len() as u32));
        self.parse_block(lexer, indent + 1)?;
        if !matches!(self.ops.last(), Some(Op::Return)) {
            self.ops.push(Op::PushNone);
            self.ops.push(Op::Return);
        }
        self.patch_jump(jump_index);
        self.ops.push(Op::PushFunction(jump_index as u32 + 1));
        self.ops.push(Op::AssignGlobal(function_slot));
        self.global = true;
        Ok(())
    }

    /// An expression statement. If the expression is followed by `=`, the
    /// just-emitted read instruction is replaced by the matching write after
    /// the right-hand side compiles; otherwise the result is discarded.
    fn parse_statement(
        &mut self,
        lexer: &mut Lexer,
        with_end_of_line: bool,
    ) -> Result<(), ScriptError> {
        self.parse_expression(lexer)?;
        let token = lexer.next()?;
        if token.kind == TokenKind::Assign {
            let last = self.ops.pop();
            self.parse_expression(lexer)?;
            match last {
                Some(Op::PushGlobal(slot)) => self.ops.push(Op::AssignGlobal(slot)),
                Some(Op::PushLocal(slot)) => self.ops.push(Op::AssignLocal(slot)),
                Some(Op::GetIndex) => self.ops.push(Op::SetIndex),
                Some(Op::GetMember(id)) => self.ops.push(Op::SetMember(id)),
                Some(other) => {
                    return Err(CompileError::at(
                        &token,
                        format!("impossible assignment ({})", other),
                    )
                    .into());
                }
                None => {
                    return Err(CompileError::at(&token, "impossible assignment").into());
                }
            }
            if with_end_of_line {
                self.expect(lexer, TokenKind::EndOfLine)?;
            }
        } else if with_end_of_line && token.kind == TokenKind::EndOfLine {
            self.ops.push(Op::Pop);
        } else {
            return Err(CompileError::at(&token, format!("unexpected: {}", token)).into());
        }
        Ok(())
    }

    fn parse_expression(&mut self, lexer: &mut Lexer) -> Result<(), ScriptError> {
        self.parse_binary_operator(lexer, 0)
    }

    fn parse_binary_operator(
        &mut self,
        lexer: &mut Lexer,
        precedence: usize,
    ) -> Result<(), ScriptError> {
        if precedence >= self.binary_operators.len() {
            return self.parse_postfix(lexer);
        }
        self.parse_binary_operator(lexer, precedence + 1)?;
        let kind = lexer.peek()?.kind;
        let matched = self.binary_operators[precedence]
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, op)| *op);
        if let Some(op) = matched {
            lexer.next()?;
            self.parse_binary_operator(lexer, precedence)?;
            self.ops.push(op);
        }
        Ok(())
    }

    /// Postfix chain: subscript `[expr]`, member `.name` (reserved opcode,
    /// unexecutable) and call `(args...)`.
    fn parse_postfix(&mut self, lexer: &mut Lexer) -> Result<(), ScriptError> {
        self.parse_unary(lexer)?;
        loop {
            match lexer.peek()?.kind {
                TokenKind::LeftBracket => {
                    lexer.next()?;
                    self.parse_expression(lexer)?;
                    self.expect(lexer, TokenKind::RightBracket)?;
                    self.ops.push(Op::GetIndex);
                }
                TokenKind::Dot => {
                    lexer.next()?;
                    let member = self.expect(lexer, TokenKind::Name)?;
                    let id = self.add_string(&member.text);
                    self.ops.push(Op::GetMember(id));
                }
                TokenKind::LeftParen => {
                    lexer.next()?;
                    let mut arg_count: u32 = 0;
                    if lexer.peek()?.kind != TokenKind::RightParen {
                        loop {
                            self.parse_expression(lexer)?;
                            arg_count += 1;
                            if lexer.peek()?.kind == TokenKind::Comma {
                                lexer.next()?;
                                continue;
                            }
                            break;
                        }
                    }
                    self.ops.push(Op::Call(arg_count));
                    self.expect(lexer, TokenKind::RightParen)?;
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn parse_unary(&mut self, lexer: &mut Lexer) -> Result<(), ScriptError> {
        match lexer.peek()?.kind {
            TokenKind::Bang => {
                lexer.next()?;
                self.parse_value(lexer)?;
                self.ops.push(Op::Not);
            }
            TokenKind::Caret => {
                lexer.next()?;
                self.parse_value(lexer)?;
                self.ops.push(Op::BitNot);
            }
            TokenKind::Minus => {
                lexer.next()?;
                self.parse_value(lexer)?;
                // Fold negation into a literal push when possible.
                match self.ops.last_mut() {
                    Some(Op::PushInt(v)) => *v = v.wrapping_neg(),
                    Some(Op::PushFloat(v)) => *v = -*v,
                    _ => self.ops.push(Op::Neg),
                }
            }
            _ => self.parse_value(lexer)?,
        }
        Ok(())
    }

    fn parse_value(&mut self, lexer: &mut Lexer) -> Result<(), ScriptError> {
        let token = lexer.next()?;
        match token.kind {
            TokenKind::LeftParen => {
                self.parse_expression(lexer)?;
                let close = lexer.next()?;
                if close.kind != TokenKind::RightParen {
                    return Err(CompileError::at(
                        &close,
                        format!("unexpected: {}, expected: ')'", close),
                    )
                    .into());
                }
            }
            TokenKind::LeftBracket => {
                self.ops.push(Op::PushEmptyList);
                if lexer.peek()?.kind != TokenKind::RightBracket {
                    loop {
                        self.parse_expression(lexer)?;
                        self.ops.push(Op::Append);
                        if lexer.peek()?.kind != TokenKind::Comma {
                            break;
                        }
                        lexer.next()?;
                    }
                }
                self.expect(lexer, TokenKind::RightBracket)?;
            }
            TokenKind::Number => {
                if token.text.contains('.') {
                    let value: f32 = token.text.parse().map_err(|_| {
                        CompileError::at(&token, format!("invalid number: {}", token.text))
                    })?;
                    self.ops.push(Op::PushFloat(value));
                } else {
                    let value: i32 = token.text.parse().map_err(|_| {
                        CompileError::at(&token, format!("invalid number: {}", token.text))
                    })?;
                    self.ops.push(Op::PushInt(value));
                }
            }
            TokenKind::Str => {
                let id = self.add_string(&token.text);
                self.ops.push(Op::PushString(id));
            }
            TokenKind::Name => match token.text.as_str() {
                "none" => self.ops.push(Op::PushNone),
                "true" => self.ops.push(Op::PushInt(1)),
                "false" => self.ops.push(Op::PushInt(0)),
                name => {
                    if !self.global {
                        if let Some(index) = self.local_vars.iter().position(|v| v == name) {
                            self.ops.push(Op::PushLocal(index as u32));
                            return Ok(());
                        }
                    }
                    match self.lookup_global(name) {
                        Some(index) => self.ops.push(Op::PushGlobal(index)),
                        None => {
                            return Err(CompileError::at(
                                &token,
                                format!("failed to find variable: {}", name),
                            )
                            .into());
                        }
                    }
                }
            },
            _ => {
                return Err(CompileError::at(&token, format!("unexpected: {}", token)).into());
            }
        }
        Ok(())
    }

    fn expect(&mut self, lexer: &mut Lexer, kind: TokenKind) -> Result<Token, ScriptError> {
        let token = lexer.next()?;
        if token.kind != kind {
            return Err(CompileError::at(
                &token,
                format!("unexpected: {}, expected: '{}'", token, kind),
            )
            .into());
        }
        Ok(token)
    }

    /// Point the placeholder jump at `index` to the next emitted instruction.
    fn patch_jump(&mut self, index: usize) {
        let target = self.ops.len() as u32;
        if let Some(Op::Jump(t) | Op::JumpIfZero(t) | Op::JumpIfNotZero(t)) =
            self.ops.get_mut(index)
        {
            *t = target;
        }
    }

    fn add_string(&mut self, value: &str) -> u32 {
        if let Some(index) = self.string_table.iter().position(|s| s == value) {
            return index as u32;
        }
        self.string_table.push(value.to_string());
        self.string_table.len() as u32 - 1
    }

    fn add_global(&mut self, token: &Token, name: &str) -> Result<u32, ScriptError> {
        if self.global_vars.iter().any(|v| v == name) {
            return Err(CompileError::at(
                token,
                format!("duplicate global variable definition: {}", name),
            )
            .into());
        }
        self.global_vars.push(name.to_string());
        Ok(self.global_vars.len() as u32 - 1)
    }

    fn lookup_global(&self, name: &str) -> Option<u32> {
        self.global_vars.iter().position(|v| v == name).map(|i| i as u32)
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Compiler::new()
    }
}
