//! Engine-neutral pieces of command binding.
//!
//! Each engine adapter turns a [`Command`] into a [`BoundCommand`]: the statements to
//! run, their arguments in placeholder order, and where output parameter values come
//! from afterwards. The helpers here do the parts every engine shares: rewriting
//! `@name` references into native placeholders, quoting identifiers and validating
//! routine names.

use crate::models::{Command, DbType, DbValue, ParameterDirection};

/// One argument bound to a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundArg {
    pub value: DbValue,
    pub db_type: DbType,
}

/// A single SQL statement with its arguments in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub args: Vec<BoundArg>,
}

impl BoundStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, value: DbValue, db_type: DbType) -> Self {
        self.args.push(BoundArg { value, db_type });
        self
    }
}

/// Where output parameter values are read from after the main statement ran.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OutputCapture {
    #[default]
    None,
    /// First row of the main statement's first result set. The set is consumed.
    MainRow { parameters: Vec<String> },
    /// First row of a follow-up statement on the same connection.
    Readback {
        statement: BoundStatement,
        parameters: Vec<String>,
    },
}

/// A command translated for one engine.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundCommand {
    /// Statements run before `main`, e.g. session variable initialisation
    pub setup: Vec<BoundStatement>,
    pub main: BoundStatement,
    pub outputs: OutputCapture,
}

impl BoundCommand {
    pub fn simple(main: BoundStatement) -> Self {
        Self {
            setup: Vec::new(),
            main,
            outputs: OutputCapture::None,
        }
    }
}

/// Lexical rules that differ between engines.
#[derive(Debug, Clone, Copy)]
pub struct Dialect {
    /// Backslash escapes inside quoted strings (MySQL)
    pub backslash_escapes: bool,
    /// `$tag$ ... $tag$` string bodies (PostgreSQL)
    pub dollar_quotes: bool,
    /// Repeated references reuse the same numbered placeholder
    pub numbered_placeholders: bool,
}

/// Result of rewriting named references.
#[derive(Debug, Clone, PartialEq)]
pub struct Rewritten {
    pub sql: String,
    /// Parameter index for each bound argument, in order
    pub order: Vec<usize>,
    /// How many `@name` references were rewritten
    pub references: usize,
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Rewrite `@name` references to native placeholders.
///
/// `lookup` maps a referenced name to a parameter index; names it does not know are
/// left untouched. `placeholder` renders a placeholder given its 1-based position and
/// the parameter index. Nothing inside string literals, quoted identifiers or comments
/// is rewritten.
pub fn rewrite_named(
    sql: &str,
    dialect: Dialect,
    lookup: impl Fn(&str) -> Option<usize>,
    mut placeholder: impl FnMut(usize, usize) -> String,
) -> Rewritten {
    let b = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut order: Vec<usize> = Vec::new();
    let mut references = 0;
    let mut last = 0;
    let mut i = 0;

    while i < b.len() {
        match b[i] {
            q @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < b.len() {
                    if dialect.backslash_escapes && q != b'`' && b[i] == b'\\' {
                        i += 2;
                        continue;
                    }
                    if b[i] == q {
                        // doubled quote is an escaped quote
                        if i + 1 < b.len() && b[i + 1] == q {
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            b'-' if b.get(i + 1) == Some(&b'-') => {
                while i < b.len() && b[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if b.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < b.len() && !(b[i] == b'*' && b.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i = (i + 2).min(b.len());
            }
            b'$' if dialect.dollar_quotes => {
                i = skip_dollar_quote(sql, i);
            }
            b'@' if b.get(i + 1) == Some(&b'@') => {
                // @@system_variable
                i += 2;
                while i < b.len() && is_ident_byte(b[i]) {
                    i += 1;
                }
            }
            b'@' => {
                let start = i + 1;
                let mut end = start;
                while end < b.len() && is_ident_byte(b[end]) {
                    end += 1;
                }
                if end > start {
                    if let Some(idx) = lookup(&sql[start..end]) {
                        out.push_str(&sql[last..i]);
                        let position = if dialect.numbered_placeholders {
                            match order.iter().position(|&p| p == idx) {
                                Some(existing) => existing + 1,
                                None => {
                                    order.push(idx);
                                    order.len()
                                }
                            }
                        } else {
                            order.push(idx);
                            order.len()
                        };
                        out.push_str(&placeholder(position, idx));
                        last = end;
                        references += 1;
                    }
                }
                i = end.max(i + 1);
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[last..]);

    Rewritten {
        sql: out,
        order,
        references,
    }
}

/// Skip a `$tag$ ... $tag$` body starting at `start`, or just the `$` when the text
/// there is a positional placeholder such as `$1`.
fn skip_dollar_quote(sql: &str, start: usize) -> usize {
    let b = sql.as_bytes();
    let mut j = start + 1;
    while j < b.len() && (b[j].is_ascii_alphabetic() || b[j] == b'_') {
        j += 1;
    }
    if j >= b.len() || b[j] != b'$' {
        return start + 1;
    }
    let tag = &sql[start..=j];
    match sql[j + 1..].find(tag) {
        Some(pos) => j + 1 + pos + tag.len(),
        None => b.len(),
    }
}

/// Bind a text command: rewrite `@name` references for input parameters, falling
/// back to declaration order when the text uses native positional placeholders.
pub fn bind_text(
    command: &Command,
    dialect: Dialect,
    placeholder: impl FnMut(usize, usize) -> String,
) -> BoundStatement {
    let params = command.parameters();
    let rewritten = rewrite_named(
        &command.text,
        dialect,
        |name| {
            params.iter().position(|p| {
                p.direction == ParameterDirection::Input && p.name().eq_ignore_ascii_case(name)
            })
        },
        placeholder,
    );

    let order: Vec<usize> = if rewritten.references == 0 {
        params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.direction == ParameterDirection::Input)
            .map(|(idx, _)| idx)
            .collect()
    } else {
        rewritten.order
    };

    BoundStatement {
        sql: rewritten.sql,
        args: order
            .into_iter()
            .map(|idx| BoundArg {
                value: params[idx].value.clone(),
                db_type: params[idx].db_type,
            })
            .collect(),
    }
}

/// Quote a possibly schema-qualified identifier, e.g. `sales.orders` becomes
/// `"sales"."orders"`.
pub fn quote_identifier(name: &str, quote: char) -> String {
    name.split('.')
        .map(|part| {
            let part = part.trim().trim_matches(quote);
            let escaped = part.replace(quote, &format!("{quote}{quote}"));
            format!("{quote}{escaped}{quote}")
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Check that a routine or variable name is safe to splice into SQL text.
pub fn validate_routine_name(name: &str) -> Result<&str, String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("routine name cannot be empty".to_string());
    }
    let valid = trimmed
        .split('.')
        .all(|part| !part.is_empty() && part.bytes().all(is_ident_byte));
    if valid {
        Ok(trimmed)
    } else {
        Err(format!("invalid routine name '{}'", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Parameter;

    const PG: Dialect = Dialect {
        backslash_escapes: false,
        dollar_quotes: true,
        numbered_placeholders: true,
    };

    const MYSQL: Dialect = Dialect {
        backslash_escapes: true,
        dollar_quotes: false,
        numbered_placeholders: false,
    };

    fn names<'a>(list: &'a [&'a str]) -> impl Fn(&str) -> Option<usize> + 'a {
        move |name| list.iter().position(|n| n.eq_ignore_ascii_case(name))
    }

    #[test]
    fn test_rewrite_numbered_reuses_positions() {
        let r = rewrite_named(
            "SELECT * FROM t WHERE a = @a OR b = @b OR c = @A",
            PG,
            names(&["a", "b"]),
            |pos, _| format!("${}", pos),
        );
        assert_eq!(r.sql, "SELECT * FROM t WHERE a = $1 OR b = $2 OR c = $1");
        assert_eq!(r.order, vec![0, 1]);
        assert_eq!(r.references, 3);
    }

    #[test]
    fn test_rewrite_question_repeats_arguments() {
        let r = rewrite_named(
            "SELECT @a, @b, @a",
            MYSQL,
            names(&["a", "b"]),
            |_, _| "?".to_string(),
        );
        assert_eq!(r.sql, "SELECT ?, ?, ?");
        assert_eq!(r.order, vec![0, 1, 0]);
    }

    #[test]
    fn test_rewrite_skips_literals_and_comments() {
        let sql = "SELECT '@a', \"@a\", `@a` -- @a\n, /* @a */ @a";
        let r = rewrite_named(sql, MYSQL, names(&["a"]), |_, _| "?".to_string());
        assert_eq!(r.sql, "SELECT '@a', \"@a\", `@a` -- @a\n, /* @a */ ?");
        assert_eq!(r.references, 1);
    }

    #[test]
    fn test_rewrite_handles_escaped_quotes() {
        let r = rewrite_named(
            "SELECT 'it''s @a', 'x\\'@a', @a",
            MYSQL,
            names(&["a"]),
            |_, _| "?".to_string(),
        );
        assert_eq!(r.sql, "SELECT 'it''s @a', 'x\\'@a', ?");
    }

    #[test]
    fn test_rewrite_leaves_unknown_and_system_variables() {
        let r = rewrite_named(
            "SELECT @@version, @counter, @a",
            MYSQL,
            names(&["a"]),
            |_, _| "?".to_string(),
        );
        assert_eq!(r.sql, "SELECT @@version, @counter, ?");
    }

    #[test]
    fn test_rewrite_skips_dollar_quoted_bodies() {
        let r = rewrite_named(
            "SELECT $body$ @a $body$, $1, @a",
            PG,
            names(&["a"]),
            |pos, _| format!("${}", pos),
        );
        assert_eq!(r.sql, "SELECT $body$ @a $body$, $1, $1");
    }

    #[test]
    fn test_rewrite_multibyte_text() {
        let r = rewrite_named(
            "SELECT '日本語 @a', @a AS 名前",
            PG,
            names(&["a"]),
            |pos, _| format!("${}", pos),
        );
        assert_eq!(r.sql, "SELECT '日本語 @a', $1 AS 名前");
    }

    #[test]
    fn test_bind_text_positional_fallback() {
        let cmd = Command::new("SELECT ?, ?").with_param("x", 1).with_param("y", "two");
        let stmt = bind_text(&cmd, MYSQL, |_, _| "?".to_string());
        assert_eq!(stmt.sql, "SELECT ?, ?");
        assert_eq!(stmt.args.len(), 2);
        assert_eq!(stmt.args[1].value, DbValue::Text("two".into()));
    }

    #[test]
    fn test_bind_text_ignores_output_parameters() {
        let cmd = Command::new("SELECT @x, @total")
            .with_param("x", 1)
            .with_parameter(Parameter::output("total", DbType::Int));
        let stmt = bind_text(&cmd, MYSQL, |_, _| "?".to_string());
        assert_eq!(stmt.sql, "SELECT ?, @total");
        assert_eq!(stmt.args.len(), 1);
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("orders", '"'), "\"orders\"");
        assert_eq!(quote_identifier("sales.orders", '`'), "`sales`.`orders`");
        assert_eq!(quote_identifier("we\"ird", '"'), "\"we\"\"ird\"");
    }

    #[test]
    fn test_validate_routine_name() {
        assert_eq!(validate_routine_name(" sales.calc_total "), Ok("sales.calc_total"));
        assert!(validate_routine_name("calc; DROP TABLE x").is_err());
        assert!(validate_routine_name("a..b").is_err());
        assert!(validate_routine_name("").is_err());
    }
}
