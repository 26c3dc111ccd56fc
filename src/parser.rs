//! Recursive-descent parser: tokens -> [`Ast`].
//!
//! Grammar (informal):
//! ```text
//! program    := stmt*
//! stmt       := vardef | funcdef | classdef | import | for | if | while
//!             | "return" expr? | exprstmt
//! vardef     := ("var" | "const") IDENT ("=" expr)?
//! funcdef    := "func" IDENT? "(" params? ")" block
//! classdef   := "class" IDENT ("(" IDENT ")")? "{" member* "}"
//! import     := "import" IDENT ("." IDENT)*
//! exprstmt   := expr ("=" expr)?
//! expr       := or_expr
//! or_expr    := and_expr ("or" and_expr)*
//! and_expr   := equality ("and" equality)*
//! equality   := comparison (("==" | "!=") comparison)*
//! comparison := additive (("<" | "<=" | ">" | ">=") additive)*
//! additive   := multiplicative (("+" | "-") multiplicative)*
//! multiplicative := unary (("*" | "/" | "%") unary)*
//! unary      := ("-" | "not") unary | postfix
//! postfix    := primary ("." IDENT | "(" args? ")")*
//! primary    := literal | IDENT | "self" | "base" | "(" expr ")"
//! ```

use thiserror::Error;

use crate::ast::{Ast, AstBuilder, AstId, BinOp, Literal, NodeId, NodeKind, Param, Pos, UnOp};
use crate::lexer::{tokenize, Keyword, Spanned, Token};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("{fileuri}:{line}:{column}: unexpected token {found:?}, expected {expected}")]
    Unexpected { fileuri: String, line: u32, column: u32, found: Token, expected: String },
    #[error("{fileuri}:{line}:{column}: invalid token in input")]
    InvalidToken { fileuri: String, line: u32, column: u32 },
}

pub struct Parser<'a> {
    fileuri: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    builder: AstBuilder,
}

impl<'a> Parser<'a> {
    pub fn new(fileuri: &'a str, source: &str) -> Self {
        Self { fileuri, tokens: tokenize(source), pos: 0, builder: AstBuilder::new() }
    }

    pub fn parse(mut self, id: AstId) -> Result<Ast, ParseError> {
        let mut stmts = Vec::new();
        while !self.check_eof() {
            stmts.push(self.statement(None)?);
        }
        let root_pos = self.tokens.first().map(|t| t.pos).unwrap_or_default();
        let root = self.builder.push(NodeKind::Block(stmts.clone()), None, root_pos);
        for s in &stmts {
            self.builder.set_parent(*s, root);
        }
        Ok(self.builder.finish(id, self.fileuri.to_string(), root))
    }

    fn check_eof(&self) -> bool {
        matches!(self.peek().token, Token::Eof)
    }

    fn peek(&self) -> &Spanned {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Spanned {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token, expected: &str) -> Result<Spanned, ParseError> {
        if self.peek().token == token {
            Ok(self.advance())
        } else {
            self.err_here(expected)
        }
    }

    fn err_here<T>(&self, expected: &str) -> Result<T, ParseError> {
        let tok = self.peek();
        if tok.token == Token::Invalid {
            return Err(ParseError::InvalidToken { fileuri: self.fileuri.to_string(), line: tok.pos.line, column: tok.pos.column });
        }
        Err(ParseError::Unexpected {
            fileuri: self.fileuri.to_string(),
            line: tok.pos.line,
            column: tok.pos.column,
            found: tok.token.clone(),
            expected: expected.to_string(),
        })
    }

    fn statement(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let pos = self.peek().pos;
        match &self.peek().token {
            Token::Keyword(Keyword::Var) | Token::Keyword(Keyword::Const) => self.vardef(parent, pos),
            Token::Keyword(Keyword::Func) => self.funcdef(parent, pos),
            Token::Keyword(Keyword::Class) => self.classdef(parent, pos),
            Token::Keyword(Keyword::Import) => self.import(parent, pos),
            Token::Keyword(Keyword::For) => self.for_stmt(parent, pos),
            Token::Keyword(Keyword::If) => self.if_stmt(parent, pos),
            Token::Keyword(Keyword::While) => self.while_stmt(parent, pos),
            Token::Keyword(Keyword::Return) => self.return_stmt(parent, pos),
            _ => self.expr_or_assign_stmt(parent, pos),
        }
    }

    fn block(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let pos = self.peek().pos;
        self.expect(Token::LBrace, "'{'")?;
        let block_id = self.builder.push(NodeKind::Block(Vec::new()), parent, pos);
        let mut stmts = Vec::new();
        while self.peek().token != Token::RBrace {
            stmts.push(self.statement(Some(block_id))?);
        }
        self.expect(Token::RBrace, "'}'")?;
        *self.builder_kind_mut(block_id) = NodeKind::Block(stmts);
        Ok(block_id)
    }

    fn builder_kind_mut(&mut self, id: NodeId) -> &mut NodeKind {
        &mut self.ast_node_mut(id).kind
    }

    fn ast_node_mut(&mut self, id: NodeId) -> &mut crate::ast::Node {
        self.builder.node_mut(id)
    }

    fn vardef(&mut self, parent: Option<NodeId>, pos: Pos) -> Result<NodeId, ParseError> {
        let is_const = self.advance().token == Token::Keyword(Keyword::Const);
        let name = self.ident("variable name")?;
        let initializer = if self.peek().token == Token::Eq {
            self.advance();
            Some(self.expr(parent)?)
        } else {
            None
        };
        let id = self.builder.push(NodeKind::VarDef { name, initializer, is_const }, parent, pos);
        if let Some(init) = initializer {
            self.builder.set_parent(init, id);
        }
        Ok(id)
    }

    fn ident(&mut self, expected: &str) -> Result<String, ParseError> {
        match self.peek().token.clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => self.err_here(expected),
        }
    }

    fn funcdef(&mut self, parent: Option<NodeId>, pos: Pos) -> Result<NodeId, ParseError> {
        self.advance();
        let name = match self.peek().token.clone() {
            Token::Ident(n) => {
                self.advance();
                Some(n)
            }
            _ => None,
        };
        self.expect(Token::LParen, "'('")?;
        let mut params = Vec::new();
        while self.peek().token != Token::RParen {
            let param_pos = self.peek().pos;
            let pname = self.ident("parameter name")?;
            let default = if self.peek().token == Token::Eq {
                self.advance();
                Some(self.expr(parent)?)
            } else {
                None
            };
            let param_node = self.builder.push(NodeKind::ParamDecl(pname.clone()), parent, param_pos);
            params.push(Param { name: pname, node: param_node, default });
            if self.peek().token == Token::Comma {
                self.advance();
            }
        }
        self.expect(Token::RParen, "')'")?;
        let is_inline = name.is_none();
        let func_id = self.builder.push(
            NodeKind::FuncDef { name: name.clone(), params: params.clone(), body: NodeId(0), is_inline },
            parent,
            pos,
        );
        for p in &params {
            self.builder.set_parent(p.node, func_id);
            if let Some(d) = p.default {
                self.builder.set_parent(d, func_id);
            }
        }
        let body = self.block(Some(func_id))?;
        *self.builder_kind_mut(func_id) = NodeKind::FuncDef { name, params, body, is_inline };
        Ok(func_id)
    }

    fn classdef(&mut self, parent: Option<NodeId>, pos: Pos) -> Result<NodeId, ParseError> {
        self.advance();
        let name = self.ident("class name")?;
        let base = if self.peek().token == Token::LParen {
            self.advance();
            let b = self.ident("base class name")?;
            self.expect(Token::RParen, "')'")?;
            Some(b)
        } else {
            None
        };
        let class_id = self.builder.push(NodeKind::ClassDef { name, base, members: Vec::new() }, parent, pos);
        self.expect(Token::LBrace, "'{'")?;
        let mut members = Vec::new();
        while self.peek().token != Token::RBrace {
            members.push(self.statement(Some(class_id))?);
        }
        self.expect(Token::RBrace, "'}'")?;
        if let NodeKind::ClassDef { members: stored, .. } = self.builder_kind_mut(class_id) {
            *stored = members;
        }
        Ok(class_id)
    }

    fn import(&mut self, parent: Option<NodeId>, pos: Pos) -> Result<NodeId, ParseError> {
        self.advance();
        let mut elements = vec![self.ident("module name")?];
        while self.peek().token == Token::Dot {
            self.advance();
            elements.push(self.ident("module path element")?);
        }
        Ok(self.builder.push(NodeKind::Import { elements, library: None }, parent, pos))
    }

    fn for_stmt(&mut self, parent: Option<NodeId>, pos: Pos) -> Result<NodeId, ParseError> {
        self.advance();
        let iterator_name = self.ident("loop variable")?;
        self.expect(Token::Keyword(Keyword::In), "'in'")?;
        let iterable = self.expr(parent)?;
        let for_id = self.builder.push(NodeKind::For { iterator_name, iterable, body: NodeId(0) }, parent, pos);
        self.builder.set_parent(iterable, for_id);
        let body = self.block(Some(for_id))?;
        if let NodeKind::For { body: stored, .. } = self.builder_kind_mut(for_id) {
            *stored = body;
        }
        Ok(for_id)
    }

    fn if_stmt(&mut self, parent: Option<NodeId>, pos: Pos) -> Result<NodeId, ParseError> {
        self.advance();
        let condition = self.expr(parent)?;
        let if_id = self.builder.push(NodeKind::If { condition, then_branch: NodeId(0), else_branch: None }, parent, pos);
        self.builder.set_parent(condition, if_id);
        let then_branch = self.block(Some(if_id))?;
        let else_branch = if self.peek().token == Token::Keyword(Keyword::Else) {
            self.advance();
            Some(self.block(Some(if_id))?)
        } else {
            None
        };
        if let NodeKind::If { then_branch: tb, else_branch: eb, .. } = self.builder_kind_mut(if_id) {
            *tb = then_branch;
            *eb = else_branch;
        }
        Ok(if_id)
    }

    fn while_stmt(&mut self, parent: Option<NodeId>, pos: Pos) -> Result<NodeId, ParseError> {
        self.advance();
        let condition = self.expr(parent)?;
        let while_id = self.builder.push(NodeKind::While { condition, body: NodeId(0) }, parent, pos);
        self.builder.set_parent(condition, while_id);
        let body = self.block(Some(while_id))?;
        if let NodeKind::While { body: stored, .. } = self.builder_kind_mut(while_id) {
            *stored = body;
        }
        Ok(while_id)
    }

    fn return_stmt(&mut self, parent: Option<NodeId>, pos: Pos) -> Result<NodeId, ParseError> {
        self.advance();
        let value = match &self.peek().token {
            Token::RBrace | Token::Eof => None,
            _ => Some(self.expr(parent)?),
        };
        let id = self.builder.push(NodeKind::Return(value), parent, pos);
        if let Some(v) = value {
            self.builder.set_parent(v, id);
        }
        Ok(id)
    }

    fn expr_or_assign_stmt(&mut self, parent: Option<NodeId>, pos: Pos) -> Result<NodeId, ParseError> {
        let expr = self.expr(parent)?;
        if self.peek().token == Token::Eq {
            self.advance();
            let value = self.expr(parent)?;
            let id = self.builder.push(NodeKind::Assign { target: expr, value }, parent, pos);
            self.builder.set_parent(expr, id);
            self.builder.set_parent(value, id);
            Ok(id)
        } else {
            let id = self.builder.push(NodeKind::ExprStmt(expr), parent, pos);
            self.builder.set_parent(expr, id);
            Ok(id)
        }
    }

    fn expr(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        self.or_expr(parent)
    }

    fn or_expr(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let mut left = self.and_expr(parent)?;
        while self.peek().token == Token::Keyword(Keyword::Or) {
            let pos = self.advance().pos;
            let right = self.and_expr(parent)?;
            left = self.bin(BinOp::Or, left, right, pos);
        }
        Ok(left)
    }

    fn and_expr(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let mut left = self.equality(parent)?;
        while self.peek().token == Token::Keyword(Keyword::And) {
            let pos = self.advance().pos;
            let right = self.equality(parent)?;
            left = self.bin(BinOp::And, left, right, pos);
        }
        Ok(left)
    }

    fn equality(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let mut left = self.comparison(parent)?;
        loop {
            let op = match self.peek().token {
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::NotEq,
                _ => break,
            };
            let pos = self.advance().pos;
            let right = self.comparison(parent)?;
            left = self.bin(op, left, right, pos);
        }
        Ok(left)
    }

    fn comparison(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let mut left = self.additive(parent)?;
        loop {
            let op = match self.peek().token {
                Token::Lt => BinOp::Lt,
                Token::LtEq => BinOp::LtEq,
                Token::Gt => BinOp::Gt,
                Token::GtEq => BinOp::GtEq,
                _ => break,
            };
            let pos = self.advance().pos;
            let right = self.additive(parent)?;
            left = self.bin(op, left, right, pos);
        }
        Ok(left)
    }

    fn additive(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let mut left = self.multiplicative(parent)?;
        loop {
            let op = match self.peek().token {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            let pos = self.advance().pos;
            let right = self.multiplicative(parent)?;
            left = self.bin(op, left, right, pos);
        }
        Ok(left)
    }

    fn multiplicative(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let mut left = self.unary(parent)?;
        loop {
            let op = match self.peek().token {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            let pos = self.advance().pos;
            let right = self.unary(parent)?;
            left = self.bin(op, left, right, pos);
        }
        Ok(left)
    }

    fn unary(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let pos = self.peek().pos;
        match self.peek().token {
            Token::Minus => {
                self.advance();
                let operand = self.unary(parent)?;
                let id = self.builder.push(NodeKind::Unary { op: UnOp::Neg, operand }, parent, pos);
                self.builder.set_parent(operand, id);
                Ok(id)
            }
            Token::Keyword(Keyword::Not) => {
                self.advance();
                let operand = self.unary(parent)?;
                let id = self.builder.push(NodeKind::Unary { op: UnOp::Not, operand }, parent, pos);
                self.builder.set_parent(operand, id);
                Ok(id)
            }
            _ => self.postfix(parent),
        }
    }

    fn postfix(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let mut node = self.primary(parent)?;
        loop {
            match self.peek().token.clone() {
                Token::Dot => {
                    let pos = self.advance().pos;
                    let name = self.ident("member name")?;
                    let ident_id = self.builder.push(NodeKind::IdentifierRef(name), Some(node), pos);
                    node = self.bin(BinOp::MemberByIdentifier, node, ident_id, pos);
                }
                Token::LParen => {
                    let pos = self.advance().pos;
                    let mut args = Vec::new();
                    let mut kwarg_names = Vec::new();
                    while self.peek().token != Token::RParen {
                        args.push(self.expr(Some(node))?);
                        kwarg_names.push(None);
                        if self.peek().token == Token::Comma {
                            self.advance();
                        }
                    }
                    self.expect(Token::RParen, "')'")?;
                    let call_id = self.builder.push(NodeKind::Call { callee: node, args: args.clone(), kwarg_names }, parent, pos);
                    self.builder.set_parent(node, call_id);
                    for a in &args {
                        self.builder.set_parent(*a, call_id);
                    }
                    node = call_id;
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn primary(&mut self, parent: Option<NodeId>) -> Result<NodeId, ParseError> {
        let pos = self.peek().pos;
        match self.peek().token.clone() {
            Token::Int(v) => {
                self.advance();
                Ok(self.builder.push(NodeKind::Literal(Literal::Int(v)), parent, pos))
            }
            Token::Float(v) => {
                self.advance();
                Ok(self.builder.push(NodeKind::Literal(Literal::Float(v)), parent, pos))
            }
            Token::Str(s) => {
                self.advance();
                Ok(self.builder.push(NodeKind::Literal(Literal::Str(s)), parent, pos))
            }
            Token::Keyword(Keyword::True) => {
                self.advance();
                Ok(self.builder.push(NodeKind::Literal(Literal::Bool(true)), parent, pos))
            }
            Token::Keyword(Keyword::False) => {
                self.advance();
                Ok(self.builder.push(NodeKind::Literal(Literal::Bool(false)), parent, pos))
            }
            Token::Keyword(Keyword::None) => {
                self.advance();
                Ok(self.builder.push(NodeKind::Literal(Literal::None), parent, pos))
            }
            Token::Keyword(Keyword::Self_) => {
                self.advance();
                Ok(self.builder.push(NodeKind::SelfRef, parent, pos))
            }
            Token::Keyword(Keyword::Base) => {
                self.advance();
                Ok(self.builder.push(NodeKind::BaseRef, parent, pos))
            }
            Token::Ident(name) => {
                self.advance();
                Ok(self.builder.push(NodeKind::IdentifierRef(name), parent, pos))
            }
            Token::LParen => {
                self.advance();
                let inner = self.expr(parent)?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            _ => self.err_here("an expression"),
        }
    }

    fn bin(&mut self, op: BinOp, left: NodeId, right: NodeId, pos: Pos) -> NodeId {
        let id = self.builder.push(NodeKind::Binary { op, left, right }, None, pos);
        self.builder.set_parent(left, id);
        self.builder.set_parent(right, id);
        id
    }
}

pub fn parse(id: AstId, fileuri: &str, source: &str) -> Result<Ast, ParseError> {
    Parser::new(fileuri, source).parse(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_function_with_return() {
        let ast = parse(AstId(0), "f", "func main { return 1 + 2 }").unwrap();
        let top = ast.top_level();
        assert_eq!(top.len(), 1);
        match &ast.node(top[0]).kind {
            NodeKind::FuncDef { name, params, .. } => {
                assert_eq!(name.as_deref(), Some("main"));
                assert!(params.is_empty());
            }
            other => panic!("expected a FuncDef, got {other:?}"),
        }
    }

    #[test]
    fn precedence_climbs_multiplicative_over_additive() {
        let ast = parse(AstId(0), "f", "1 + 2 * 3").unwrap();
        let stmt = ast.top_level()[0];
        let NodeKind::ExprStmt(expr) = &ast.node(stmt).kind else { panic!("expected an ExprStmt") };
        match &ast.node(*expr).kind {
            NodeKind::Binary { op: BinOp::Add, left, right } => {
                assert!(matches!(ast.node(*left).kind, NodeKind::Literal(Literal::Int(1))));
                assert!(matches!(ast.node(*right).kind, NodeKind::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("expected top-level Add, got {other:?}"),
        }
    }

    #[test]
    fn postfix_chains_member_access_and_call() {
        let ast = parse(AstId(0), "f", "a.b.c()").unwrap();
        let stmt = ast.top_level()[0];
        let NodeKind::ExprStmt(expr) = &ast.node(stmt).kind else { panic!("expected an ExprStmt") };
        assert!(matches!(ast.node(*expr).kind, NodeKind::Call { .. }));
    }

    #[test]
    fn missing_closing_brace_is_a_parse_error_not_a_panic() {
        let err = parse(AstId(0), "f", "func main { return 1").unwrap_err();
        assert!(matches!(err, ParseError::Unexpected { .. }));
    }

    #[test]
    fn classdef_with_base_and_member() {
        let ast = parse(AstId(0), "f", "class Dog(Animal) { var name }").unwrap();
        match &ast.node(ast.top_level()[0]).kind {
            NodeKind::ClassDef { name, base, members } => {
                assert_eq!(name, "Dog");
                assert_eq!(base.as_deref(), Some("Animal"));
                assert_eq!(members.len(), 1);
            }
            other => panic!("expected a ClassDef, got {other:?}"),
        }
    }
}
