// siterestore/src/restore/db/splitter.rs

/// Splits a MySQL dump into statements, one line at a time.
///
/// Terminators inside `'…'`, `"…"` and `` `…` `` are ignored, backslash escapes
/// are honoured inside string literals, `--`/`#` line comments are dropped and
/// `/* … */` blocks are kept (dumps carry `/*!40101 … */` statements). A
/// `DELIMITER` line switches the terminator, as the mysql client does.
#[derive(Debug)]
pub struct StatementSplitter {
    buffer: String,
    quote: Option<char>,
    escaped: bool,
    in_block_comment: bool,
    delimiter: String,
}

impl Default for StatementSplitter {
    fn default() -> Self {
        StatementSplitter {
            buffer: String::new(),
            quote: None,
            escaped: false,
            in_block_comment: false,
            delimiter: ";".to_string(),
        }
    }
}

impl StatementSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between statements, outside any string or comment.
    pub fn at_statement_start(&self) -> bool {
        self.quote.is_none() && !self.in_block_comment && self.buffer.trim().is_empty()
    }

    fn emit(&mut self, out: &mut Vec<String>) {
        let statement = self.buffer.trim();
        if !statement.is_empty() {
            out.push(statement.to_string());
        }
        self.buffer.clear();
    }

    /// Feeds one line (without its newline) and returns the statements it
    /// completed.
    pub fn push_line(&mut self, line: &str) -> Vec<String> {
        let mut out = Vec::new();

        if self.at_statement_start() {
            let trimmed = line.trim_start();
            if let Some(directive) = trimmed.get(..10) {
                if directive.eq_ignore_ascii_case("DELIMITER ") {
                    let delimiter = trimmed[10..].trim();
                    if !delimiter.is_empty() {
                        self.delimiter = delimiter.to_string();
                    }
                    return out;
                }
            }
        }

        let mut i = 0;
        while i < line.len() {
            let rest = &line[i..];
            let Some(c) = rest.chars().next() else {
                break;
            };
            let width = c.len_utf8();

            if self.in_block_comment {
                if rest.starts_with("*/") {
                    self.buffer.push_str("*/");
                    self.in_block_comment = false;
                    i += 2;
                } else {
                    self.buffer.push(c);
                    i += width;
                }
                continue;
            }

            if let Some(quote) = self.quote {
                self.buffer.push(c);
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' && quote != '`' {
                    self.escaped = true;
                } else if c == quote {
                    self.quote = None;
                }
                i += width;
                continue;
            }

            if rest.starts_with(self.delimiter.as_str()) {
                i += self.delimiter.len();
                self.emit(&mut out);
                continue;
            }
            match c {
                '\'' | '"' | '`' => {
                    self.quote = Some(c);
                    self.buffer.push(c);
                }
                '#' => break,
                '-' if is_dash_comment(rest) => break,
                '/' if rest.starts_with("/*") => {
                    self.in_block_comment = true;
                    self.buffer.push_str("/*");
                    i += 2;
                    continue;
                }
                _ => self.buffer.push(c),
            }
            i += width;
        }

        if !self.buffer.is_empty() {
            self.buffer.push('\n');
        }
        out
    }

    /// Returns the trailing statement that had no terminator, if any.
    pub fn finish(mut self) -> Option<String> {
        if self.quote.is_some() {
            log::warn!("SQL input ended inside an unterminated quoted string");
        }
        let mut out = Vec::new();
        self.emit(&mut out);
        out.pop()
    }
}

/// `--` starts a comment only when followed by whitespace or the line end.
fn is_dash_comment(rest: &str) -> bool {
    let mut chars = rest.chars();
    chars.next() == Some('-')
        && chars.next() == Some('-')
        && chars.next().is_none_or(char::is_whitespace)
}

/// Splits a whole SQL text.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut splitter = StatementSplitter::new();
    let mut statements: Vec<String> = sql.lines().flat_map(|l| splitter.push_line(l)).collect();
    statements.extend(splitter.finish());
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semicolons_inside_literals_do_not_split() {
        let sql = "INSERT INTO t VALUES ('a;b', \"c;d\", `e;f`);\nINSERT INTO t VALUES ('it\\'s; fine');";
        let statements = split_statements(sql);
        assert_eq!(
            statements,
            vec![
                "INSERT INTO t VALUES ('a;b', \"c;d\", `e;f`)",
                "INSERT INTO t VALUES ('it\\'s; fine')",
            ]
        );
    }

    #[test]
    fn test_multiline_string_keeps_newlines() {
        let statements = split_statements("INSERT INTO t VALUES ('line1\nline2;');\nSELECT 1;");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "INSERT INTO t VALUES ('line1\nline2;')");
    }

    #[test]
    fn test_comments() {
        let sql = "-- MySQL dump\n# hash comment\n/*!40101 SET NAMES utf8 */;\nSELECT 1; -- trailing\nSELECT '-- not a comment';\nSELECT 2--1;";
        let statements = split_statements(sql);
        assert_eq!(
            statements,
            vec![
                "/*!40101 SET NAMES utf8 */",
                "SELECT 1",
                "SELECT '-- not a comment'",
                "SELECT 2--1",
            ]
        );
    }

    #[test]
    fn test_delimiter_directive() {
        let sql = "DELIMITER ;;\nCREATE TRIGGER tr BEFORE INSERT ON t FOR EACH ROW BEGIN SET NEW.a = 1; END;;\nDELIMITER ;\nSELECT 1;";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("SET NEW.a = 1; END"));
        assert_eq!(statements[1], "SELECT 1");
    }

    #[test]
    fn test_unterminated_tail_is_returned_by_finish() {
        let mut splitter = StatementSplitter::new();
        assert_eq!(splitter.push_line("SELECT 1; SELECT"), vec!["SELECT 1"]);
        assert!(splitter.push_line("2").is_empty());
        assert_eq!(splitter.finish().as_deref(), Some("SELECT\n2"));
    }

    #[test]
    fn test_doubled_quotes() {
        let statements = split_statements("INSERT INTO t VALUES ('O''Brien;');");
        assert_eq!(statements, vec!["INSERT INTO t VALUES ('O''Brien;')"]);
    }
}
