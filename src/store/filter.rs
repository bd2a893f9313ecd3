//! Search predicates for storage areas.
//!
//! A small boolean language compiled to a parametrized SQL `WHERE` clause over
//! `storage_main`. Only validated column names are spliced into the SQL text; every
//! literal and every property name is a bound parameter.
//!
//! **Supported Syntax:**
//! - Comparisons: `Name == "chest"`, `Amount >= 10`, `Crafter like "bo%"`
//! - Operators: `==` `=` `!=` `<>` `<` `<=` `>` `>=` `like`
//! - Logic: `&&` / `and`, `||` / `or`, `!` / `not`, parentheses
//! - Casts: `int(Prop)`, `float(Prop)`, `text(Prop)`; comparing a field with a
//!   numeric literal casts it implicitly
//! - Literals: `"text"`, `'text'`, `42`, `-7`, `0x1F`, `1.5`
//!
//! Identifiers naming a column compile to that column; any other identifier looks up
//! the property row of that name.

use std::fmt;

use rusqlite::params_from_iter;

use crate::logutil::{describe_value, escape_log};
use crate::store::binder::{quote_ident, TableBinding};
use crate::store::errors::{StoreError, StoreResult};
use crate::store::property::{parse_integer, Value};
use crate::store::schema::Category;
use crate::store::serial::Serial;
use crate::store::session::StoreSession;

pub const MAX_FILTER_LEN: usize = 1024;
pub const MAX_DEPTH: usize = 32;

/// Token types for lexical analysis
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Identifier(String),
    String(String),
    Integer(i64),
    Float(f64),

    And,
    Or,
    Not,
    Like,
    Equal,
    NotEqual,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,

    LeftParen,
    RightParen,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Identifier(s) => write!(f, "identifier '{}'", s),
            Token::String(s) => write!(f, "string \"{}\"", s),
            Token::Integer(n) => write!(f, "number {}", n),
            Token::Float(n) => write!(f, "number {}", n),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Like => write!(f, "like"),
            Token::Equal => write!(f, "=="),
            Token::NotEqual => write!(f, "!="),
            Token::Greater => write!(f, ">"),
            Token::Less => write!(f, "<"),
            Token::GreaterEqual => write!(f, ">="),
            Token::LessEqual => write!(f, "<="),
            Token::LeftParen => write!(f, "("),
            Token::RightParen => write!(f, ")"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Integer,
    Real,
    Text,
}

impl CastKind {
    fn from_keyword(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "int" => Some(CastKind::Integer),
            "float" => Some(CastKind::Real),
            "text" => Some(CastKind::Text),
            _ => None,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            CastKind::Integer => "INTEGER",
            CastKind::Real => "REAL",
            CastKind::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Like,
}

impl CompareOp {
    fn sql(self) -> &'static str {
        match self {
            CompareOp::Equal => "=",
            CompareOp::NotEqual => "<>",
            CompareOp::Less => "<",
            CompareOp::LessEqual => "<=",
            CompareOp::Greater => ">",
            CompareOp::GreaterEqual => ">=",
            CompareOp::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Cast(CastKind, String),
    Text(String),
    Integer(i64),
    Float(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

/// Tokenizer for predicate text
pub struct Tokenizer {
    input: Vec<char>,
    position: usize,
}

impl Tokenizer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        self.position += 1;
        ch
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.current(), Some(ch) if ch.is_whitespace()) {
            self.advance();
        }
    }

    fn read_string(&mut self, quote: char) -> Result<String, String> {
        self.advance();
        let mut result = String::new();
        while let Some(ch) = self.advance() {
            if ch == quote {
                return Ok(result);
            }
            if ch == '\\' {
                match self.advance() {
                    Some('n') => result.push('\n'),
                    Some('t') => result.push('\t'),
                    Some(other) => result.push(other),
                    None => break,
                }
            } else {
                result.push(ch);
            }
        }
        Err("unterminated string literal".to_string())
    }

    fn read_identifier(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    fn read_number(&mut self) -> Result<Token, String> {
        let mut text = String::new();
        if self.current() == Some('-') {
            text.push('-');
            self.advance();
        }
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == '.' {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        let lower = text.to_ascii_lowercase();
        let unsigned = lower.trim_start_matches('-');
        if unsigned.starts_with("0x") {
            let magnitude = parse_integer(unsigned).ok_or_else(|| format!("bad hex number '{text}'"))?;
            return Ok(Token::Integer(if lower.starts_with('-') { -magnitude } else { magnitude }));
        }
        if let Ok(n) = lower.parse::<i64>() {
            return Ok(Token::Integer(n));
        }
        lower
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite() && !lower.contains("inf") && !lower.contains("nan"))
            .map(Token::Float)
            .ok_or_else(|| format!("bad number '{text}'"))
    }

    pub fn next_token(&mut self) -> Result<Token, String> {
        self.skip_whitespace();
        let Some(ch) = self.current() else {
            return Ok(Token::Eof);
        };
        let token = match ch {
            '"' | '\'' => Token::String(self.read_string(ch)?),
            '0'..='9' => self.read_number()?,
            '-' if matches!(self.peek(1), Some('0'..='9')) => self.read_number()?,
            '(' => {
                self.advance();
                Token::LeftParen
            }
            ')' => {
                self.advance();
                Token::RightParen
            }
            '&' if self.peek(1) == Some('&') => {
                self.position += 2;
                Token::And
            }
            '|' if self.peek(1) == Some('|') => {
                self.position += 2;
                Token::Or
            }
            '=' => {
                self.advance();
                if self.current() == Some('=') {
                    self.advance();
                }
                Token::Equal
            }
            '!' => {
                self.advance();
                if self.current() == Some('=') {
                    self.advance();
                    Token::NotEqual
                } else {
                    Token::Not
                }
            }
            '<' => {
                self.advance();
                match self.current() {
                    Some('=') => {
                        self.advance();
                        Token::LessEqual
                    }
                    Some('>') => {
                        self.advance();
                        Token::NotEqual
                    }
                    _ => Token::Less,
                }
            }
            '>' => {
                self.advance();
                if self.current() == Some('=') {
                    self.advance();
                    Token::GreaterEqual
                } else {
                    Token::Greater
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let word = self.read_identifier();
                match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "like" => Token::Like,
                    _ => Token::Identifier(word),
                }
            }
            other => return Err(format!("unexpected character '{}'", other)),
        };
        Ok(token)
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }
}

/// Recursive-descent parser over the token stream
pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
    depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
            depth: 0,
        }
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        self.position += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        if *self.current() == expected {
            self.advance();
            Ok(())
        } else {
            Err(format!("expected {}, found {}", expected, self.current()))
        }
    }

    fn enter(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(format!("predicate nested deeper than {}", MAX_DEPTH));
        }
        Ok(())
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.advance() {
            Token::String(s) => Ok(Operand::Text(s)),
            Token::Integer(n) => Ok(Operand::Integer(n)),
            Token::Float(n) => Ok(Operand::Float(n)),
            Token::Identifier(name) => {
                if *self.current() == Token::LeftParen {
                    let kind = CastKind::from_keyword(&name)
                        .ok_or_else(|| format!("unknown function '{}'", name))?;
                    self.advance();
                    let field = match self.advance() {
                        Token::Identifier(field) => field,
                        other => return Err(format!("expected field name, found {}", other)),
                    };
                    self.expect(Token::RightParen)?;
                    Ok(Operand::Cast(kind, field))
                } else {
                    Ok(Operand::Field(name))
                }
            }
            other => Err(format!("expected value or field, found {}", other)),
        }
    }

    fn parse_comparison(&mut self) -> Result<Predicate, String> {
        let left = self.parse_operand()?;
        let op = match self.advance() {
            Token::Equal => CompareOp::Equal,
            Token::NotEqual => CompareOp::NotEqual,
            Token::Less => CompareOp::Less,
            Token::LessEqual => CompareOp::LessEqual,
            Token::Greater => CompareOp::Greater,
            Token::GreaterEqual => CompareOp::GreaterEqual,
            Token::Like => CompareOp::Like,
            other => return Err(format!("expected comparison operator, found {}", other)),
        };
        let right = self.parse_operand()?;
        if !matches!(left, Operand::Field(_) | Operand::Cast(..))
            && !matches!(right, Operand::Field(_) | Operand::Cast(..))
        {
            return Err("comparison needs at least one field".to_string());
        }
        Ok(Predicate::Compare { left, op, right })
    }

    fn parse_unary(&mut self) -> Result<Predicate, String> {
        self.enter()?;
        let result = match self.current() {
            Token::Not => {
                self.advance();
                self.parse_unary().map(|p| Predicate::Not(Box::new(p)))
            }
            Token::LeftParen => {
                self.advance();
                let inner = self.parse_or();
                inner.and_then(|p| self.expect(Token::RightParen).map(|_| p))
            }
            _ => self.parse_comparison(),
        };
        self.depth -= 1;
        result
    }

    fn parse_and(&mut self) -> Result<Predicate, String> {
        let mut left = self.parse_unary()?;
        while *self.current() == Token::And {
            self.advance();
            let right = self.parse_unary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Predicate, String> {
        let mut left = self.parse_and()?;
        while *self.current() == Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    pub fn parse(&mut self) -> Result<Predicate, String> {
        let predicate = self.parse_or()?;
        if *self.current() != Token::Eof {
            return Err(format!("unexpected {} after predicate", self.current()));
        }
        Ok(predicate)
    }
}

/// Parse predicate text into a tree.
pub fn parse_predicate(text: &str) -> Result<Predicate, String> {
    if text.trim().is_empty() {
        return Err("empty predicate".to_string());
    }
    if text.len() > MAX_FILTER_LEN {
        return Err(format!("predicate longer than {} bytes", MAX_FILTER_LEN));
    }
    let tokens = Tokenizer::new(text).tokenize()?;
    Parser::new(tokens).parse()
}

/// A compiled `WHERE` fragment over `storage_main m` and its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub sql: String,
    pub params: Vec<Value>,
}

struct Compiler<'a> {
    binding: &'a TableBinding,
    prop_table: &'static str,
    params: Vec<Value>,
}

impl Compiler<'_> {
    fn field(&mut self, name: &str) -> String {
        match self.binding.column(name) {
            Some(col) => format!("m.{}", quote_ident(&col.name)),
            None => {
                self.params.push(Value::from(name));
                format!(
                    "(SELECT p.PropValue FROM {} p WHERE p.Serial = m.Serial AND p.PropName = ? ORDER BY p.IsCustom LIMIT 1)",
                    self.prop_table
                )
            }
        }
    }

    fn operand(&mut self, operand: &Operand, implicit: Option<CastKind>) -> String {
        match operand {
            Operand::Field(name) => {
                let base = self.field(name);
                match implicit {
                    Some(kind) => format!("CAST({} AS {})", base, kind.sql()),
                    None => base,
                }
            }
            Operand::Cast(kind, name) => {
                let base = self.field(name);
                format!("CAST({} AS {})", base, kind.sql())
            }
            Operand::Text(s) => {
                self.params.push(Value::from(s.as_str()));
                "?".to_string()
            }
            Operand::Integer(n) => {
                self.params.push(Value::Integer(*n));
                "?".to_string()
            }
            Operand::Float(n) => {
                self.params.push(Value::Real(*n));
                "?".to_string()
            }
        }
    }

    fn predicate(&mut self, predicate: &Predicate) -> String {
        match predicate {
            Predicate::Compare { left, op, right } => {
                let numeric = |other: &Operand| match other {
                    Operand::Integer(_) => Some(CastKind::Integer),
                    Operand::Float(_) => Some(CastKind::Real),
                    _ => None,
                };
                let left_sql = self.operand(left, numeric(right));
                let right_sql = self.operand(right, numeric(left));
                format!("{} {} {}", left_sql, op.sql(), right_sql)
            }
            Predicate::And(a, b) => {
                let a = self.predicate(a);
                let b = self.predicate(b);
                format!("({} AND {})", a, b)
            }
            Predicate::Or(a, b) => {
                let a = self.predicate(a);
                let b = self.predicate(b);
                format!("({} OR {})", a, b)
            }
            Predicate::Not(inner) => format!("NOT ({})", self.predicate(inner)),
        }
    }
}

/// Compile predicate text against the bound storage table. Malformed input yields
/// `StoreError::InvalidFilter` carrying a message for the caller.
pub fn compile(text: &str, binding: &TableBinding) -> StoreResult<CompiledFilter> {
    let predicate = parse_predicate(text).map_err(StoreError::InvalidFilter)?;
    let mut compiler = Compiler {
        binding,
        prop_table: Category::Storage.prop_table(),
        params: Vec::new(),
    };
    let sql = compiler.predicate(&predicate);
    log::debug!(
        "filter '{}' -> {} [{}]",
        escape_log(text),
        sql,
        compiler
            .params
            .iter()
            .map(describe_value)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(CompiledFilter {
        sql,
        params: compiler.params,
    })
}

/// Serials in an area matching a compiled filter, in serial order.
pub fn search(session: &StoreSession, area_id: i64, filter: &CompiledFilter) -> StoreResult<Vec<Serial>> {
    let sql = format!(
        "SELECT m.Serial FROM storage_main m WHERE m.AreaId = ? AND ({}) ORDER BY m.Serial",
        filter.sql
    );
    let mut params = Vec::with_capacity(filter.params.len() + 1);
    params.push(Value::Integer(area_id));
    params.extend(filter.params.iter().cloned());
    let mut stmt = session.connection().prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| row.get::<_, Serial>(0))?;
    let serials = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(serials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::property::PropertySet;
    use crate::store::session::SessionOptions;

    #[test]
    fn test_tokenize_operators() {
        let tokens = Tokenizer::new("a == 1 && b != 'x' || !(c <= 0x10) and d like \"%e\"")
            .tokenize()
            .unwrap();
        assert_eq!(tokens[1], Token::Equal);
        assert_eq!(tokens[3], Token::And);
        assert_eq!(tokens[5], Token::NotEqual);
        assert_eq!(tokens[6], Token::String("x".into()));
        assert_eq!(tokens[7], Token::Or);
        assert_eq!(tokens[8], Token::Not);
        assert_eq!(tokens[12], Token::Integer(16));
        assert_eq!(tokens[14], Token::And);
        assert_eq!(tokens[16], Token::Like);
        assert_eq!(*tokens.last().unwrap(), Token::Eof);
    }

    #[test]
    fn test_tokenize_numbers() {
        let tokens = Tokenizer::new("-5 1.25 0xff -0x10").tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Integer(-5),
                Token::Float(1.25),
                Token::Integer(255),
                Token::Integer(-16),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_parse_precedence() {
        let parsed = parse_predicate("a = 1 or b = 2 and c = 3").unwrap();
        match parsed {
            Predicate::Or(_, right) => assert!(matches!(*right, Predicate::And(..))),
            other => panic!("unexpected tree {:?}", other),
        }
    }

    #[test]
    fn malformed_predicates_report_messages() {
        for (text, fragment) in [
            ("", "empty"),
            ("Name ==", "expected value"),
            ("Name = 'open", "unterminated"),
            ("(Name = 'a'", "expected )"),
            ("Name ~ 1", "unexpected character"),
            ("1 = 2", "at least one field"),
            ("max(Amount) > 1", "unknown function"),
            ("Name = 'a' Amount", "unexpected"),
        ] {
            let err = parse_predicate(text).unwrap_err();
            assert!(err.contains(fragment), "{text:?} gave {err:?}");
        }
        let deep = format!("{}a = 1{}", "(".repeat(40), ")".repeat(40));
        assert!(parse_predicate(&deep).unwrap_err().contains("nested"));
        let long = format!("Name = '{}'", "x".repeat(MAX_FILTER_LEN));
        assert!(parse_predicate(&long).is_err());
    }

    fn session_with_items() -> (StoreSession, i64) {
        let session = StoreSession::open_in_memory(SessionOptions::default()).expect("session");
        let area = session.ensure_area("bank").expect("area");
        for (serial, name, amount, crafter) in [
            (0x4000_0001u32, "chest", 1u32, None),
            (0x4000_0002, "gold coin", 500, Some("17")),
            (0x4000_0003, "silver coin", 20, Some("9")),
        ] {
            let mut set = PropertySet::new(Serial(serial));
            set.set_main("Name", name);
            set.set_main("ObjType", 0x0EEDu32);
            set.set_main("Graphic", 0x0EEDu32);
            set.set_main("X", 0);
            set.set_main("Y", 0);
            set.set_main("Z", 0);
            set.set_main("Realm", "britannia");
            set.set_main("Revision", 0);
            if amount != 1 {
                set.set_unusual("Amount", amount);
            }
            if let Some(level) = crafter {
                set.set_custom("CraftLevel", level);
            }
            session
                .insert_record(Category::Storage, &set, Some(area))
                .expect("insert");
        }
        (session, area)
    }

    fn run(session: &StoreSession, area: i64, text: &str) -> Vec<Serial> {
        let compiled = compile(text, session.binding(Category::Storage)).expect("compile");
        search(session, area, &compiled).expect("search")
    }

    #[test]
    fn literals_are_bound_not_spliced() {
        let (session, _) = session_with_items();
        let compiled = compile(
            "Name = \"x'; DROP TABLE storage_main; --\"",
            session.binding(Category::Storage),
        )
        .unwrap();
        assert!(!compiled.sql.contains("DROP"));
        assert_eq!(compiled.params.len(), 1);
    }

    #[test]
    fn search_matches_columns_and_properties() {
        let (session, area) = session_with_items();
        assert_eq!(
            run(&session, area, "Name like '%coin'"),
            vec![Serial(0x4000_0002), Serial(0x4000_0003)]
        );
        assert_eq!(run(&session, area, "Amount > 100"), vec![Serial(0x4000_0002)]);
        // Implicit integer cast: text "9" < 10 numerically, not lexically.
        assert_eq!(run(&session, area, "CraftLevel < 10"), vec![Serial(0x4000_0003)]);
        assert_eq!(
            run(&session, area, "int(CraftLevel) >= 0x11"),
            vec![Serial(0x4000_0002)]
        );
        assert_eq!(
            run(&session, area, "not (Name = 'chest') and float(CraftLevel) > 8.5"),
            vec![Serial(0x4000_0002), Serial(0x4000_0003)]
        );
        assert!(run(&session, area + 1, "Name = 'chest'").is_empty());
    }

    #[test]
    fn compile_errors_are_invalid_filter() {
        let (session, _) = session_with_items();
        let err = compile("Name ==", session.binding(Category::Storage)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidFilter(_)));
    }
}
