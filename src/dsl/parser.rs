//! Recursive-descent parser for the pipeline expression DSL, producing a
//! [`GraphSpec`] by driving the three host callbacks SPEC_FULL §2.3
//! requires: variable resolution, node construction, and connection.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::core::runtime::{EdgeSpec, GraphSpec, NodeSpec};
use crate::dsl::lexer::{tokenize, LexError, Token};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),
    #[error("unexpected end of input")]
    Eof,
    #[error("expected {expected}, found {found:?}")]
    Unexpected { expected: &'static str, found: Token },
    #[error("unknown variable root '{0}' (expected argv or env)")]
    UnknownVarRoot(String),
    #[error("argv index {0} out of range ({1} positional arguments)")]
    ArgvOutOfRange(usize, usize),
    #[error("env variable '{0}' is not set")]
    MissingEnv(String),
    #[error("a comma group cannot appear on the left of '|': fan-in is not supported")]
    FanInNotSupported,
}

/// Resolves `argv.N` / `env.NAME` variable references against the process's
/// positional trailing arguments and environment (spec §6, SPEC_FULL §2.3).
pub struct VarResolver<'a> {
    pub argv: &'a [String],
    pub env: &'a HashMap<String, String>,
}

impl<'a> VarResolver<'a> {
    fn resolve(&self, root: &str, key: &str) -> Result<Value, ParseError> {
        match root {
            "argv" => {
                let index: usize = key
                    .parse()
                    .map_err(|_| ParseError::Unexpected {
                        expected: "numeric argv index",
                        found: Token::Ident(key.to_string()),
                    })?;
                self.argv
                    .get(index.saturating_sub(1))
                    .cloned()
                    .map(Value::String)
                    .ok_or(ParseError::ArgvOutOfRange(index, self.argv.len()))
            }
            "env" => self
                .env
                .get(key)
                .cloned()
                .map(Value::String)
                .ok_or_else(|| ParseError::MissingEnv(key.to_string())),
            other => Err(ParseError::UnknownVarRoot(other.to_string())),
        }
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    resolver: VarResolver<'a>,
    anon_counter: HashMap<String, usize>,
}

/// Parse a pipeline expression into a [`GraphSpec`], resolving any
/// `argv.N`/`env.NAME` references against `argv`/`env` as it goes.
pub fn parse_pipeline(
    src: &str,
    argv: &[String],
    env: &HashMap<String, String>,
) -> Result<GraphSpec, ParseError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        resolver: VarResolver { argv, env },
        anon_counter: HashMap::new(),
    };
    parser.parse_pipeline()
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: &'static str, matcher: impl Fn(&Token) -> bool) -> Result<Token, ParseError> {
        match self.advance() {
            Some(tok) if matcher(&tok) => Ok(tok),
            Some(tok) => Err(ParseError::Unexpected { expected, found: tok }),
            None => Err(ParseError::Eof),
        }
    }

    fn parse_pipeline(&mut self) -> Result<GraphSpec, ParseError> {
        let mut graph = GraphSpec::default();
        self.parse_chain(&mut graph)?;
        while matches!(self.peek(), Some(Token::Semicolon)) {
            self.advance();
            if self.peek().is_none() {
                break;
            }
            self.parse_chain(&mut graph)?;
        }
        if self.pos != self.tokens.len() {
            return Err(ParseError::Unexpected {
                expected: "end of input",
                found: self.tokens[self.pos].clone(),
            });
        }
        Ok(graph)
    }

    fn parse_chain(&mut self, graph: &mut GraphSpec) -> Result<(), ParseError> {
        let mut left = self.parse_group(graph)?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            if left.len() > 1 {
                return Err(ParseError::FanInNotSupported);
            }
            self.advance();
            let right = self.parse_group(graph)?;
            for from in &left {
                for to in &right {
                    graph.edges.push(EdgeSpec {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
            left = right;
        }
        Ok(())
    }

    fn parse_group(&mut self, graph: &mut GraphSpec) -> Result<Vec<String>, ParseError> {
        let mut ids = vec![self.parse_node(graph)?];
        while matches!(self.peek(), Some(Token::Comma)) {
            self.advance();
            ids.push(self.parse_node(graph)?);
        }
        Ok(ids)
    }

    fn parse_node(&mut self, graph: &mut GraphSpec) -> Result<String, ParseError> {
        let type_name = match self.advance() {
            Some(Token::Ident(name)) => name,
            Some(tok) => return Err(ParseError::Unexpected { expected: "stage type name", found: tok }),
            None => return Err(ParseError::Eof),
        };

        self.expect("'('", |t| matches!(t, Token::LParen))?;
        let mut named = HashMap::new();
        let mut positional = Vec::new();
        if !matches!(self.peek(), Some(Token::RParen)) {
            loop {
                self.parse_arg(&mut named, &mut positional)?;
                if matches!(self.peek(), Some(Token::Comma)) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect("')'", |t| matches!(t, Token::RParen))?;

        let explicit_id = if matches!(self.peek(), Some(Token::At)) {
            self.advance();
            match self.advance() {
                Some(Token::Ident(id)) => Some(id),
                Some(tok) => return Err(ParseError::Unexpected { expected: "identifier after '@'", found: tok }),
                None => return Err(ParseError::Eof),
            }
        } else {
            None
        };

        let id = explicit_id.unwrap_or_else(|| {
            let n = self.anon_counter.entry(type_name.clone()).or_insert(0);
            *n += 1;
            format!("{type_name}#{n}")
        });

        graph.nodes.push(NodeSpec {
            id: id.clone(),
            type_name,
            named,
            positional,
        });
        Ok(id)
    }

    fn parse_arg(
        &mut self,
        named: &mut HashMap<String, Value>,
        positional: &mut Vec<Value>,
    ) -> Result<(), ParseError> {
        // Lookahead: `ident '=' value` is named, anything else is positional.
        if let Some(Token::Ident(name)) = self.peek().cloned() {
            if matches!(self.tokens.get(self.pos + 1), Some(Token::Eq)) {
                self.advance(); // ident
                self.advance(); // '='
                let value = self.parse_value()?;
                named.insert(name, value);
                return Ok(());
            }
        }
        let value = self.parse_value()?;
        positional.push(value);
        Ok(())
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Number(n)) => Ok(serde_json::json!(n)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Ident(root)) if root == "argv" || root == "env" => {
                self.expect("'.'", |t| matches!(t, Token::Dot))?;
                let key = match self.advance() {
                    Some(Token::Ident(k)) => k,
                    Some(Token::Number(n)) => format!("{}", n as i64),
                    Some(tok) => return Err(ParseError::Unexpected { expected: "variable key", found: tok }),
                    None => return Err(ParseError::Eof),
                };
                self.resolver.resolve(&root, &key)
            }
            Some(tok) => Err(ParseError::Unexpected { expected: "a value", found: tok }),
            None => Err(ParseError::Eof),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linear_chain_into_nodes_and_edges() {
        let graph = parse_pipeline("file(path=\"a.wav\") | vad() | sentence()", &[], &HashMap::new()).unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edges[0].from, "file#1");
        assert_eq!(graph.edges[0].to, "vad#1");
        assert_eq!(graph.edges[1].from, "vad#1");
        assert_eq!(graph.edges[1].to, "sentence#1");
    }

    #[test]
    fn explicit_id_is_used_verbatim() {
        let graph = parse_pipeline("file() @src | vad() @v", &[], &HashMap::new()).unwrap();
        assert_eq!(graph.nodes[0].id, "src");
        assert_eq!(graph.nodes[1].id, "v");
    }

    #[test]
    fn fan_out_connects_singleton_to_every_node_in_the_right_group() {
        let graph = parse_pipeline("file() @src | a(), b()", &[], &HashMap::new()).unwrap();
        assert_eq!(graph.edges.len(), 2);
        assert!(graph.edges.iter().all(|e| e.from == "src"));
    }

    #[test]
    fn comma_group_on_the_left_of_pipe_is_rejected() {
        let err = parse_pipeline("a() @x, b() @y | sink() @s", &[], &HashMap::new()).unwrap_err();
        assert!(matches!(err, ParseError::FanInNotSupported));
    }

    #[test]
    fn argv_and_env_vars_resolve() {
        let argv = vec!["input.wav".to_string()];
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "secret-value".to_string());
        let graph = parse_pipeline("file(path=argv.1, key=env.API_KEY)", &argv, &env).unwrap();
        assert_eq!(graph.nodes[0].named["path"], Value::String("input.wav".into()));
        assert_eq!(graph.nodes[0].named["key"], Value::String("secret-value".into()));
    }

    #[test]
    fn missing_env_var_errors() {
        let err = parse_pipeline("file(key=env.MISSING)", &[], &HashMap::new()).unwrap_err();
        assert!(matches!(err, ParseError::MissingEnv(name) if name == "MISSING"));
    }

    #[test]
    fn semicolon_separates_independent_chains() {
        let graph = parse_pipeline("a() | b(); c() | d()", &[], &HashMap::new()).unwrap();
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.edges.len(), 2);
    }
}
