//! Calc: a small expression evaluator built on typed queries.
//!
//! - Inputs: source text per file, variable bindings
//! - Derived: parsing, evaluation
//! - Incremental recomputation and early cutoff

use std::cell::Cell;
use std::sync::Arc;

use revquery::{
    async_trait, CancellationToken, DependencySystem, EventCollector, ExecutionResult, Input,
    Query, QueryContext, QueryError, QueryResult, TraceEvent,
};

// ============================================================================
// Expression AST
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(i64),
    Variable(String),
    BinOp {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, thiserror::Error)]
pub enum CalcError {
    #[error("unexpected {0:?}")]
    Unexpected(String),
    #[error("unexpected end of input")]
    Eof,
    #[error("division by zero")]
    DivisionByZero,
}

// ============================================================================
// Inputs and queries
// ============================================================================

struct SourceText;

impl Input for SourceText {
    type Key = String;
    type Value = Arc<str>;
}

struct Variable;

impl Input for Variable {
    type Key = String;
    type Value = i64;
}

// Queries run on the test thread under `get_sync`.
thread_local! {
    static PARSE_RUNS: Cell<u32> = const { Cell::new(0) };
    static EVAL_RUNS: Cell<u32> = const { Cell::new(0) };
}

fn bump(counter: &'static std::thread::LocalKey<Cell<u32>>) {
    counter.with(|c| c.set(c.get() + 1));
}

fn runs(counter: &'static std::thread::LocalKey<Cell<u32>>) -> u32 {
    counter.with(Cell::get)
}

struct ParseExpr;

#[async_trait]
impl Query for ParseExpr {
    type Key = String;
    type Value = Expr;

    async fn recompute(ctx: QueryContext<'_>, file: String) -> QueryResult<Expr> {
        bump(&PARSE_RUNS);
        let source = ctx.input_of::<SourceText>(file)?;
        parse(&source).map_err(QueryError::failed)
    }

    fn value_eq(old: &Expr, new: &Expr) -> bool {
        old == new
    }
}

struct EvalFile;

#[async_trait]
impl Query for EvalFile {
    type Key = String;
    type Value = i64;

    async fn recompute(ctx: QueryContext<'_>, file: String) -> QueryResult<i64> {
        bump(&EVAL_RUNS);
        let expr = ctx.get::<ParseExpr>(file).await?;
        eval(&ctx, &expr)
    }

    fn value_eq(old: &i64, new: &i64) -> bool {
        old == new
    }
}

fn eval(ctx: &QueryContext<'_>, expr: &Expr) -> QueryResult<i64> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Variable(name) => ctx.input_of::<Variable>(name.clone()),
        Expr::BinOp { op, lhs, rhs } => {
            let lhs = eval(ctx, lhs)?;
            let rhs = eval(ctx, rhs)?;
            match op {
                BinOp::Add => Ok(lhs + rhs),
                BinOp::Sub => Ok(lhs - rhs),
                BinOp::Mul => Ok(lhs * rhs),
                BinOp::Div if rhs == 0 => Err(QueryError::failed(CalcError::DivisionByZero)),
                BinOp::Div => Ok(lhs / rhs),
            }
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(i64),
    Ident(String),
    Op(char),
}

fn tokenize(input: &str) -> Result<Vec<Token>, CalcError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() {
            let mut n = 0i64;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                n = n * 10 + i64::from(d);
                chars.next();
            }
            tokens.push(Token::Number(n));
        } else if c.is_alphabetic() || c == '_' {
            let mut name = String::new();
            while let Some(&c) = chars.peek().filter(|c| c.is_alphanumeric() || **c == '_') {
                name.push(c);
                chars.next();
            }
            tokens.push(Token::Ident(name));
        } else if "+-*/()".contains(c) {
            tokens.push(Token::Op(c));
            chars.next();
        } else {
            return Err(CalcError::Unexpected(c.to_string()));
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<char> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(c)) => Some(*c),
            _ => None,
        }
    }

    fn binary(
        &mut self,
        ops: &[(char, BinOp)],
        next: fn(&mut Self) -> Result<Expr, CalcError>,
    ) -> Result<Expr, CalcError> {
        let mut lhs = next(self)?;
        while let Some(op) = self
            .peek_op()
            .and_then(|c| ops.iter().find(|(o, _)| *o == c).map(|(_, op)| *op))
        {
            self.pos += 1;
            let rhs = next(self)?;
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, CalcError> {
        self.binary(&[('+', BinOp::Add), ('-', BinOp::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr, CalcError> {
        self.binary(&[('*', BinOp::Mul), ('/', BinOp::Div)], Self::primary)
    }

    fn primary(&mut self) -> Result<Expr, CalcError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(CalcError::Eof)?;
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Ident(name) => Ok(Expr::Variable(name)),
            Token::Op('(') => {
                let expr = self.additive()?;
                match self.peek_op() {
                    Some(')') => {
                        self.pos += 1;
                        Ok(expr)
                    }
                    _ => Err(CalcError::Eof),
                }
            }
            Token::Op(c) => Err(CalcError::Unexpected(c.to_string())),
        }
    }
}

fn parse(input: &str) -> Result<Expr, CalcError> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
    };
    let expr = parser.additive()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(expr),
        Some(token) => Err(CalcError::Unexpected(format!("{:?}", token))),
    }
}

// ============================================================================
// Tests
// ============================================================================

fn eval_file(system: &DependencySystem, file: &str) -> QueryResult<i64> {
    system.get_sync::<EvalFile>(file.to_string(), &CancellationToken::new())
}

fn set_source(system: &DependencySystem, file: &str, text: &str) {
    system
        .set::<SourceText>(file.to_string(), Arc::from(text))
        .unwrap();
}

fn set_variable(system: &DependencySystem, name: &str, value: i64) {
    system.set::<Variable>(name.to_string(), value).unwrap();
}

#[test]
fn test_simple_expression() {
    let system = DependencySystem::new();
    set_source(&system, "main", "1 + 2 * 3");
    assert_eq!(eval_file(&system, "main").unwrap(), 7);
}

#[test]
fn test_parentheses_and_precedence() {
    let system = DependencySystem::new();
    set_source(&system, "a", "(1 + 2) * 3");
    set_source(&system, "b", "((2 + 3) * 4 - 5) / 3");
    set_source(&system, "c", "100 - 50 / 2");

    assert_eq!(eval_file(&system, "a").unwrap(), 9);
    assert_eq!(eval_file(&system, "b").unwrap(), 5);
    assert_eq!(eval_file(&system, "c").unwrap(), 75);
}

#[test]
fn test_with_variables() {
    let system = DependencySystem::new();
    set_source(&system, "main", "x + y * 2");
    set_variable(&system, "x", 10);
    set_variable(&system, "y", 5);
    assert_eq!(eval_file(&system, "main").unwrap(), 20);
}

#[test]
fn test_unbound_variable() {
    let system = DependencySystem::new();
    set_source(&system, "main", "answer");

    let err = eval_file(&system, "main").unwrap_err();
    assert!(matches!(err, QueryError::UnsetInput { .. }));

    set_variable(&system, "answer", 42);
    assert_eq!(eval_file(&system, "main").unwrap(), 42);
}

#[test]
fn test_variable_change_skips_parsing() {
    let system = DependencySystem::new();
    set_source(&system, "main", "a * b + c");
    set_variable(&system, "a", 2);
    set_variable(&system, "b", 3);
    set_variable(&system, "c", 4);

    let (parse0, eval0) = (runs(&PARSE_RUNS), runs(&EVAL_RUNS));
    assert_eq!(eval_file(&system, "main").unwrap(), 10);

    set_variable(&system, "c", 5);
    assert_eq!(eval_file(&system, "main").unwrap(), 11);
    assert_eq!(runs(&PARSE_RUNS) - parse0, 1);
    assert_eq!(runs(&EVAL_RUNS) - eval0, 2);
}

#[test]
fn test_whitespace_edit_is_cut_off() {
    let collector = Arc::new(EventCollector::new());
    let system = DependencySystem::builder()
        .tracer(collector.clone())
        .build();
    set_source(&system, "main", "1 + 2");

    let (parse0, eval0) = (runs(&PARSE_RUNS), runs(&EVAL_RUNS));
    assert_eq!(eval_file(&system, "main").unwrap(), 3);

    set_source(&system, "main", "1  +  2 ");
    assert_eq!(eval_file(&system, "main").unwrap(), 3);
    assert_eq!(runs(&PARSE_RUNS) - parse0, 2);
    assert_eq!(runs(&EVAL_RUNS) - eval0, 1);

    let parse_results: Vec<_> = collector
        .events()
        .into_iter()
        .filter_map(|event| match event {
            TraceEvent::QueryEnd { slot, result } if slot.contains("ParseExpr") => {
                Some(result)
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        parse_results,
        vec![ExecutionResult::Changed, ExecutionResult::Unchanged]
    );
}

#[test]
fn test_domain_errors() {
    let system = DependencySystem::new();
    set_source(&system, "div", "4 / (2 - 2)");
    set_source(&system, "bad", "4 $ 2");

    let err = eval_file(&system, "div").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CalcError>(),
        Some(CalcError::DivisionByZero)
    ));

    let err = eval_file(&system, "bad").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CalcError>(),
        Some(CalcError::Unexpected(c)) if c == "$"
    ));

    set_source(&system, "bad", "4 - 2");
    assert_eq!(eval_file(&system, "bad").unwrap(), 2);
}

#[test]
fn test_multiple_files_share_nothing() {
    let system = DependencySystem::new();
    set_source(&system, "a", "10");
    set_source(&system, "b", "20 + 5");

    assert_eq!(eval_file(&system, "a").unwrap(), 10);
    assert_eq!(eval_file(&system, "b").unwrap(), 25);

    let eval0 = runs(&EVAL_RUNS);
    set_source(&system, "b", "20 + 6");
    assert_eq!(eval_file(&system, "a").unwrap(), 10);
    assert_eq!(eval_file(&system, "b").unwrap(), 26);
    assert_eq!(runs(&EVAL_RUNS) - eval0, 1);
}
