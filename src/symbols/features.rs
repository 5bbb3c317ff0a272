//! User-defined feature buckets.
//!
//! A features file lists named features, each with an optional colour and a
//! set of mappings:
//!
//! ```text
//! # networking code
//! Net(10 20 30) {
//!     com.foo.net.*                       # package prefix
//!     com.foo.Socket                      # type
//!     com.foo.Pool::take(I)               # method
//!     com.foo.Pool::grow()[4 17]          # bytecode range of a method
//! }
//! ```
//!
//! An allocation site is attributed by walking its call chain from the
//! innermost frame. For each frame the tiers are tried in order (instruction
//! range, method, type, package); the first tier with any match decides.
//! Sites matching nothing land in the implicit "others" feature.

use crate::error::FeaturesError;
use crate::symbols::{AllocationSite, CallSite};
use smallvec::{smallvec, SmallVec};
use std::collections::HashMap;
use std::path::Path;

pub const OTHERS_FEATURE: usize = 0;
const OTHERS_COLOR: (u8, u8, u8) = (127, 127, 127);

const PALETTE: [(u8, u8, u8); 8] = [
    (31, 119, 180),
    (255, 127, 14),
    (44, 160, 44),
    (214, 39, 40),
    (148, 103, 189),
    (140, 86, 75),
    (227, 119, 194),
    (188, 189, 34),
];

pub type FeatureSet = SmallVec<[usize; 2]>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Feature {
    pub id: usize,
    pub name: String,
    pub color: (u8, u8, u8),
}

#[derive(Clone, Debug, Default)]
struct TypeRules {
    instructions: Vec<(String, String, i32, i32, usize)>,
    methods: Vec<(String, String, usize)>,
    types: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct FeatureMap {
    features: Vec<Feature>,
    by_type: HashMap<String, TypeRules>,
    packages: Vec<(String, usize)>,
}

impl Default for FeatureMap {
    fn default() -> Self {
        FeatureMap {
            features: vec![Feature {
                id: OTHERS_FEATURE,
                name: "others".to_string(),
                color: OTHERS_COLOR,
            }],
            by_type: HashMap::new(),
            packages: vec![],
        }
    }
}

impl FeatureMap {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<FeatureMap> {
        let text = std::fs::read_to_string(path)?;
        Ok(FeatureMap::parse(&text)?)
    }

    pub fn parse(text: &str) -> Result<FeatureMap, FeaturesError> {
        let tokens = lex(text)?;
        Parser {
            tokens,
            pos: 0,
            map: FeatureMap::default(),
        }
        .parse()
    }

    /// All features, `others` first
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.len() == 1
    }

    pub fn get(&self, id: usize) -> Option<&Feature> {
        self.features.get(id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == name)
    }

    pub fn classify(&self, site: &AllocationSite) -> FeatureSet {
        for cs in &site.call_sites {
            let ids = self.match_call_site(cs);
            if !ids.is_empty() {
                return ids;
            }
        }
        smallvec![OTHERS_FEATURE]
    }

    fn match_call_site(&self, cs: &CallSite) -> FeatureSet {
        let mut ids = FeatureSet::new();
        if let Some(rules) = self.by_type.get(&cs.declaring_type) {
            for (method, params, from, to, id) in &rules.instructions {
                if *method == cs.method && *params == cs.params && *from <= cs.bci && cs.bci <= *to {
                    push_unique(&mut ids, *id);
                }
            }
            if !ids.is_empty() {
                return ids;
            }
            for (method, params, id) in &rules.methods {
                if *method == cs.method && *params == cs.params {
                    push_unique(&mut ids, *id);
                }
            }
            if !ids.is_empty() {
                return ids;
            }
            for id in &rules.types {
                push_unique(&mut ids, *id);
            }
            if !ids.is_empty() {
                return ids;
            }
        }
        for (prefix, id) in &self.packages {
            if cs.declaring_type.starts_with(prefix.as_str()) {
                push_unique(&mut ids, *id);
            }
        }
        ids
    }
}

fn push_unique(ids: &mut FeatureSet, id: usize) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Ident(String),
    Number(i64),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Star,
    PathSep,
    Eof,
}

#[derive(Clone, Debug)]
struct Spanned {
    token: Token,
    row: usize,
    col: usize,
}

fn is_ident_end(c: char) -> bool {
    c.is_whitespace() || "*():{}[]#".contains(c)
}

fn lex(text: &str) -> Result<Vec<Spanned>, FeaturesError> {
    let mut tokens = vec![];
    let mut chars = text.chars().peekable();
    let (mut row, mut col) = (1usize, 1usize);
    while let Some(&c) = chars.peek() {
        let (start_row, start_col) = (row, col);
        let error = |message: String| FeaturesError {
            row: start_row,
            col: start_col,
            message,
        };
        if c == '\n' {
            chars.next();
            row += 1;
            col = 1;
            continue;
        }
        if c.is_whitespace() {
            chars.next();
            col += 1;
            continue;
        }
        if c == '#' {
            while let Some(&c) = chars.peek() {
                if c == '\n' {
                    break;
                }
                chars.next();
                col += 1;
            }
            continue;
        }
        let token = match c {
            '(' | ')' | '{' | '}' | '[' | ']' | '*' => {
                chars.next();
                col += 1;
                match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    _ => Token::Star,
                }
            }
            ':' => {
                chars.next();
                col += 1;
                if chars.peek() != Some(&':') {
                    return Err(error("expected '::'".to_string()));
                }
                chars.next();
                col += 1;
                Token::PathSep
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut digits = String::new();
                digits.push(c);
                chars.next();
                col += 1;
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                    col += 1;
                }
                let n = digits
                    .parse::<i64>()
                    .map_err(|_| error(format!("invalid number '{}'", digits)))?;
                Token::Number(n)
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if is_ident_end(d) {
                        break;
                    }
                    ident.push(d);
                    chars.next();
                    col += 1;
                }
                Token::Ident(ident)
            }
            other => return Err(error(format!("unexpected character '{}'", other))),
        };
        tokens.push(Spanned {
            token,
            row: start_row,
            col: start_col,
        });
    }
    tokens.push(Spanned {
        token: Token::Eof,
        row,
        col,
    });
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    map: FeatureMap,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn error(&self, message: impl Into<String>) -> FeaturesError {
        let t = &self.tokens[self.pos];
        FeaturesError {
            row: t.row,
            col: t.col,
            message: message.into(),
        }
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].token.clone();
        if t != Token::Eof {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: Token) -> Result<(), FeaturesError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}, found {:?}", expected, self.peek())))
        }
    }

    fn ident(&mut self) -> Result<String, FeaturesError> {
        if let Token::Ident(s) = self.peek().clone() {
            self.advance();
            Ok(s)
        } else {
            Err(self.error(format!("expected identifier, found {:?}", self.peek())))
        }
    }

    fn number(&mut self) -> Result<i64, FeaturesError> {
        if let Token::Number(n) = self.peek().clone() {
            self.advance();
            Ok(n)
        } else {
            Err(self.error(format!("expected number, found {:?}", self.peek())))
        }
    }

    fn color_component(&mut self) -> Result<u8, FeaturesError> {
        let err = self.error("colour component must be within 0..=255");
        let n = self.number()?;
        u8::try_from(n).map_err(|_| err)
    }

    fn parse(mut self) -> Result<FeatureMap, FeaturesError> {
        while *self.peek() != Token::Eof {
            self.feature()?;
        }
        Ok(self.map)
    }

    fn feature(&mut self) -> Result<(), FeaturesError> {
        let name_err = self.error("duplicate feature name");
        let name = self.ident()?;
        if self.map.by_name(&name).is_some() {
            return Err(name_err);
        }
        let id = self.map.features.len();
        let color = if *self.peek() == Token::LParen {
            self.advance();
            let r = self.color_component()?;
            let g = self.color_component()?;
            let b = self.color_component()?;
            self.expect(Token::RParen)?;
            (r, g, b)
        } else {
            PALETTE[(id - 1) % PALETTE.len()]
        };
        self.map.features.push(Feature { id, name, color });
        self.expect(Token::LBrace)?;
        while *self.peek() != Token::RBrace {
            if *self.peek() == Token::Eof {
                return Err(self.error("unterminated feature body"));
            }
            self.mapping(id)?;
        }
        self.expect(Token::RBrace)
    }

    fn mapping(&mut self, id: usize) -> Result<(), FeaturesError> {
        let name = self.ident()?;
        match self.peek().clone() {
            Token::Star => {
                self.advance();
                self.map.packages.push((name, id));
            }
            Token::PathSep => {
                self.advance();
                let method = self.ident()?;
                self.expect(Token::LParen)?;
                let params = if let Token::Ident(_) = self.peek() {
                    self.ident()?
                } else {
                    String::new()
                };
                self.expect(Token::RParen)?;
                if *self.peek() == Token::LBracket {
                    self.advance();
                    let range_err = self.error("instruction range must satisfy from <= to");
                    let from = self.number()?;
                    let to = self.number()?;
                    self.expect(Token::RBracket)?;
                    if from > to || from < 0 || to > i32::MAX as i64 {
                        return Err(range_err);
                    }
                    let rules = self.map.by_type.entry(name).or_default();
                    rules
                        .instructions
                        .push((method, params, from as i32, to as i32, id));
                } else {
                    let rules = self.map.by_type.entry(name).or_default();
                    rules.methods.push((method, params, id));
                }
            }
            _ => self.map.by_type.entry(name).or_default().types.push(id),
        }
        Ok(())
    }
}
