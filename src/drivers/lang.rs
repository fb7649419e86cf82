//! The shared policy expression grammar.
//!
//! Both engines parse with the same expression grammar; the rule engine
//! layers `deny`/`for` statements on top of it. Grammar sketch:
//!
//! ```text
//! stmt    := "deny" STRING ("when" expr)?
//!          | "for" IDENT "in" expr "{" stmt* "}"
//! expr    := and_expr ("or" and_expr)*
//! and     := not_expr ("and" not_expr)*
//! not     := "not" not | cmp
//! cmp     := primary (("=="|"!="|"<"|"<="|">"|">=") primary)?
//! primary := STRING | NUMBER | "true" | "false" | "null"
//!          | IDENT "(" args ")" | IDENT ("." IDENT | "[" expr "]")*
//!          | "(" expr ")"
//! ```
//!
//! `#` starts a line comment. Deny messages interpolate `${expr}`.

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag, take_while};
use nom::character::complete::{char as ch, multispace1, satisfy};
use nom::combinator::{all_consuming, map, opt, recognize, value, verify};
use nom::multi::{fold_many0, many0, separated_list0};
use nom::sequence::{delimited, pair, preceded, terminated};
use serde_json::Value;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One step of a field path.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    Index(Box<Expr>),
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path { root: String, segments: Vec<Segment> },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call { func: String, args: Vec<Expr> },
}

impl Expr {
    /// Whether the expression (transitively) calls the given builtin.
    pub fn calls(&self, func: &str) -> bool {
        match self {
            Self::Literal(_) => false,
            Self::Path { segments, .. } => segments.iter().any(|s| match s {
                Segment::Field(_) => false,
                Segment::Index(e) => e.calls(func),
            }),
            Self::Not(e) => e.calls(func),
            Self::And(a, b) | Self::Or(a, b) => a.calls(func) || b.calls(func),
            Self::Compare { lhs, rhs, .. } => lhs.calls(func) || rhs.calls(func),
            Self::Call { func: f, args } => f == func || args.iter().any(|a| a.calls(func)),
        }
    }

    /// Nesting depth of the expression tree.
    pub fn depth(&self) -> usize {
        1 + match self {
            Self::Literal(_) => 0,
            Self::Path { segments, .. } => segments
                .iter()
                .map(|s| match s {
                    Segment::Field(_) => 0,
                    Segment::Index(e) => e.depth(),
                })
                .max()
                .unwrap_or(0),
            Self::Not(e) => e.depth(),
            Self::And(a, b) | Self::Or(a, b) => a.depth().max(b.depth()),
            Self::Compare { lhs, rhs, .. } => lhs.depth().max(rhs.depth()),
            Self::Call { args, .. } => args.iter().map(Expr::depth).max().unwrap_or(0),
        }
    }
}

/// One piece of a deny message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(String),
    Expr(Expr),
}

/// A deny message with `${expr}` interpolation pre-parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTemplate {
    pub parts: Vec<MessagePart>,
}

impl MessageTemplate {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut parts = Vec::new();
        let mut rest = raw;
        while let Some(idx) = rest.find("${") {
            if idx > 0 {
                parts.push(MessagePart::Text(rest[..idx].to_string()));
            }
            let after = &rest[idx + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| format!("unterminated ${{ in message '{raw}'"))?;
            let expr = parse_expression(&after[..end])
                .map_err(|e| format!("bad interpolation in message '{raw}': {e}"))?;
            parts.push(MessagePart::Expr(expr));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            parts.push(MessagePart::Text(rest.to_string()));
        }
        Ok(Self { parts })
    }

    /// The raw text of a template without interpolations.
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            parts: vec![MessagePart::Text(text.into())],
        }
    }
}

/// A rule-engine statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Deny {
        message: MessageTemplate,
        when: Option<Expr>,
    },
    For {
        var: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
}

impl Stmt {
    fn any_expr(&self, pred: &dyn Fn(&Expr) -> bool) -> bool {
        match self {
            Self::Deny { message, when } => {
                when.as_ref().is_some_and(pred)
                    || message.parts.iter().any(|p| match p {
                        MessagePart::Expr(e) => pred(e),
                        MessagePart::Text(_) => false,
                    })
            }
            Self::For {
                iterable, body, ..
            } => pred(iterable) || body.iter().any(|s| s.any_expr(pred)),
        }
    }

    /// Whether the statement (transitively) calls the given builtin.
    pub fn calls(&self, func: &str) -> bool {
        self.any_expr(&|e| e.calls(func))
    }
}

const RESERVED: [&str; 10] = [
    "deny", "for", "in", "when", "and", "or", "not", "true", "false", "null",
];

// ---------------------------------------------------------------------------
// Grammar
// ---------------------------------------------------------------------------

/// Skip whitespace and `#` line comments.
fn sp(i: &str) -> IResult<&str, ()> {
    value(
        (),
        many0(alt((
            value((), multispace1),
            value((), pair(ch('#'), opt(is_not("\n")))),
        ))),
    )(i)
}

fn identifier(i: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(i)
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    verify(identifier, move |s: &&str| *s == kw)
}

fn string_literal(i: &str) -> IResult<&str, String> {
    delimited(
        ch('"'),
        map(
            opt(escaped_transform(
                is_not("\\\""),
                '\\',
                alt((
                    value("\\", tag("\\")),
                    value("\"", tag("\"")),
                    value("\n", tag("n")),
                    value("\t", tag("t")),
                    value("$", tag("$")),
                )),
            )),
            Option::unwrap_or_default,
        ),
        ch('"'),
    )(i)
}

fn cmp_op(i: &str) -> IResult<&str, CmpOp> {
    alt((
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
    ))(i)
}

fn number_literal(i: &str) -> IResult<&str, Expr> {
    map(nom::number::complete::double, |n| {
        // Keep whole values as integers so `== 3` compares cleanly.
        if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
            Expr::Literal(Value::from(n as i64))
        } else {
            Expr::Literal(Value::from(n))
        }
    })(i)
}

fn path_segment(i: &str) -> IResult<&str, Segment> {
    alt((
        map(preceded(ch('.'), identifier), |f| {
            Segment::Field(f.to_string())
        }),
        map(
            delimited(ch('['), expression, preceded(sp, ch(']'))),
            |e| Segment::Index(Box::new(e)),
        ),
    ))(i)
}

fn word_expr(i: &str) -> IResult<&str, Expr> {
    let (i, word) = identifier(i)?;
    match word {
        "true" => return Ok((i, Expr::Literal(Value::Bool(true)))),
        "false" => return Ok((i, Expr::Literal(Value::Bool(false)))),
        "null" => return Ok((i, Expr::Literal(Value::Null))),
        w if RESERVED.contains(&w) => {
            return Err(nom::Err::Error(nom::error::Error::new(
                i,
                nom::error::ErrorKind::Verify,
            )));
        }
        _ => {}
    }

    if i.starts_with('(') {
        let (i, args) = delimited(
            ch('('),
            separated_list0(preceded(sp, ch(',')), expression),
            preceded(sp, ch(')')),
        )(i)?;
        return Ok((
            i,
            Expr::Call {
                func: word.to_string(),
                args,
            },
        ));
    }

    let (i, segments) = many0(path_segment)(i)?;
    Ok((
        i,
        Expr::Path {
            root: word.to_string(),
            segments,
        },
    ))
}

fn primary(i: &str) -> IResult<&str, Expr> {
    let (i, _) = sp(i)?;
    alt((
        map(string_literal, |s| Expr::Literal(Value::String(s))),
        delimited(ch('('), expression, preceded(sp, ch(')'))),
        word_expr,
        number_literal,
    ))(i)
}

fn cmp_expr(i: &str) -> IResult<&str, Expr> {
    let (i, lhs) = primary(i)?;
    let (i, rest) = opt(pair(preceded(sp, cmp_op), primary))(i)?;
    Ok(match rest {
        Some((op, rhs)) => (
            i,
            Expr::Compare {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        ),
        None => (i, lhs),
    })
}

fn not_expr(i: &str) -> IResult<&str, Expr> {
    let (i, _) = sp(i)?;
    alt((
        map(preceded(keyword("not"), not_expr), |e| {
            Expr::Not(Box::new(e))
        }),
        cmp_expr,
    ))(i)
}

fn and_expr(i: &str) -> IResult<&str, Expr> {
    let (i, first) = not_expr(i)?;
    fold_many0(
        preceded(preceded(sp, keyword("and")), not_expr),
        move || first.clone(),
        |acc, rhs| Expr::And(Box::new(acc), Box::new(rhs)),
    )(i)
}

fn expression(i: &str) -> IResult<&str, Expr> {
    let (i, first) = and_expr(i)?;
    fold_many0(
        preceded(preceded(sp, keyword("or")), and_expr),
        move || first.clone(),
        |acc, rhs| Expr::Or(Box::new(acc), Box::new(rhs)),
    )(i)
}

fn deny_stmt(i: &str) -> IResult<&str, Stmt> {
    let (i, _) = keyword("deny")(i)?;
    let (i, raw) = preceded(sp, string_literal)(i)?;
    let message = match MessageTemplate::parse(&raw) {
        Ok(m) => m,
        Err(_) => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                i,
                nom::error::ErrorKind::MapRes,
            )));
        }
    };
    let (i, when) = opt(preceded(preceded(sp, keyword("when")), expression))(i)?;
    Ok((i, Stmt::Deny { message, when }))
}

fn for_stmt(i: &str) -> IResult<&str, Stmt> {
    let (i, _) = keyword("for")(i)?;
    let (i, var) = preceded(
        sp,
        verify(identifier, |s: &&str| !RESERVED.contains(s)),
    )(i)?;
    let (i, _) = preceded(sp, keyword("in"))(i)?;
    let (i, iterable) = expression(i)?;
    let (i, _) = preceded(sp, ch('{'))(i)?;
    let (i, body) = many0(statement)(i)?;
    let (i, _) = preceded(sp, ch('}'))(i)?;
    Ok((
        i,
        Stmt::For {
            var: var.to_string(),
            iterable,
            body,
        },
    ))
}

fn statement(i: &str) -> IResult<&str, Stmt> {
    preceded(sp, alt((deny_stmt, for_stmt)))(i)
}

fn describe_error(src: &str, err: nom::Err<nom::error::Error<&str>>) -> String {
    let remaining = match &err {
        nom::Err::Error(e) | nom::Err::Failure(e) => e.input,
        nom::Err::Incomplete(_) => "",
    };
    let offset = src.len().saturating_sub(remaining.len());
    let line = src[..offset].chars().filter(|c| *c == '\n').count() + 1;
    let snippet: String = remaining.chars().take(24).collect();
    if snippet.is_empty() {
        format!("syntax error at line {line}: unexpected end of source")
    } else {
        format!("syntax error at line {line} near '{snippet}'")
    }
}

/// Parse a rule-engine source body.
pub fn parse_rules(src: &str) -> Result<Vec<Stmt>, String> {
    match all_consuming(terminated(many0(statement), sp))(src) {
        Ok((_, stmts)) if stmts.is_empty() => Err("source contains no rules".to_string()),
        Ok((_, stmts)) => Ok(stmts),
        Err(err) => Err(describe_error(src, err)),
    }
}

/// Parse a single expression (the expression engine's unit of compilation).
pub fn parse_expression(src: &str) -> Result<Expr, String> {
    match all_consuming(terminated(expression, sp))(src) {
        Ok((_, expr)) => Ok(expr),
        Err(err) => Err(describe_error(src, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_literals() {
        assert_eq!(
            parse_expression("\"hi\"").unwrap(),
            Expr::Literal(json!("hi"))
        );
        assert_eq!(parse_expression("42").unwrap(), Expr::Literal(json!(42)));
        assert_eq!(
            parse_expression("2.5").unwrap(),
            Expr::Literal(json!(2.5))
        );
        assert_eq!(
            parse_expression("true").unwrap(),
            Expr::Literal(json!(true))
        );
        assert_eq!(parse_expression("null").unwrap(), Expr::Literal(json!(null)));
    }

    #[test]
    fn test_parse_string_escapes() {
        assert_eq!(
            parse_expression(r#""a\"b\\c\n""#).unwrap(),
            Expr::Literal(json!("a\"b\\c\n"))
        );
        assert_eq!(parse_expression(r#""""#).unwrap(), Expr::Literal(json!("")));
    }

    #[test]
    fn test_parse_paths() {
        let e = parse_expression("object.metadata.labels[key]").unwrap();
        let Expr::Path { root, segments } = e else {
            panic!("expected path");
        };
        assert_eq!(root, "object");
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment::Field("metadata".into()));
        assert!(matches!(&segments[2], Segment::Index(_)));
    }

    #[test]
    fn test_parse_precedence() {
        // not binds tighter than and; and tighter than or.
        let e = parse_expression("not a or b and c").unwrap();
        let Expr::Or(lhs, rhs) = e else {
            panic!("expected or at the top");
        };
        assert!(matches!(*lhs, Expr::Not(_)));
        assert!(matches!(*rhs, Expr::And(_, _)));
    }

    #[test]
    fn test_parse_comparison() {
        let e = parse_expression("count(object.spec.containers) >= 2").unwrap();
        let Expr::Compare { op, lhs, .. } = e else {
            panic!("expected comparison");
        };
        assert_eq!(op, CmpOp::Ge);
        assert!(matches!(*lhs, Expr::Call { .. }));
    }

    #[test]
    fn test_parse_call() {
        let e = parse_expression("inventory(\"\", \"Service\", object.metadata.namespace)")
            .unwrap();
        let Expr::Call { func, args } = e else {
            panic!("expected call");
        };
        assert_eq!(func, "inventory");
        assert_eq!(args.len(), 3);
        assert!(e_calls(&Expr::Call { func, args }, "inventory"));
    }

    fn e_calls(e: &Expr, f: &str) -> bool {
        e.calls(f)
    }

    #[test]
    fn test_parse_rules_program() {
        let src = r#"
            # required labels
            for label in params.labels {
                deny "missing required labels: ${label}" when not object.metadata.labels[label]
            }
        "#;
        let stmts = parse_rules(src).unwrap();
        assert_eq!(stmts.len(), 1);
        let Stmt::For { var, body, .. } = &stmts[0] else {
            panic!("expected for");
        };
        assert_eq!(var, "label");
        assert_eq!(body.len(), 1);
        let Stmt::Deny { message, when } = &body[0] else {
            panic!("expected deny");
        };
        assert!(when.is_some());
        assert_eq!(message.parts.len(), 2);
    }

    #[test]
    fn test_parse_unconditional_deny() {
        let stmts = parse_rules("deny \"always\"").unwrap();
        assert_eq!(
            stmts,
            vec![Stmt::Deny {
                message: MessageTemplate::literal("always"),
                when: None
            }]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_rules("").is_err());
        assert!(parse_rules("deny").is_err());
        assert!(parse_rules("deny \"x\" extra").is_err());
        assert!(parse_expression("a ==").is_err());
        assert!(parse_expression("for x in y").is_err());
        // Unterminated interpolation is a compile error.
        assert!(parse_rules("deny \"${object.name\"").is_err());
    }

    #[test]
    fn test_reserved_words_are_not_paths() {
        assert!(parse_expression("when").is_err());
        assert!(parse_expression("deny").is_err());
    }

    #[test]
    fn test_depth_and_calls() {
        let e = parse_expression("not (a.b == inventory(\"\", \"Pod\", null))").unwrap();
        assert!(e.calls("inventory"));
        assert!(!e.calls("count"));
        assert!(e.depth() >= 3);

        let stmts = parse_rules(
            "for s in inventory(\"\", \"Service\", null) { deny \"dup ${s.metadata.name}\" }",
        )
        .unwrap();
        assert!(stmts[0].calls("inventory"));
    }
}
