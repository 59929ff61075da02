/// One statement of a SQL script with the line it starts on (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStatement {
    pub sql: String,
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitScript {
    pub statements: Vec<ScriptStatement>,
    /// Lines holding psql meta-commands, which are not SQL and were skipped.
    pub skipped_meta_commands: Vec<usize>,
}

enum State {
    Normal,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment(usize),
    Dollar(String),
}

/// Split a script on top-level semicolons.
///
/// Quotes, `--` and nested `/* */` comments and `$tag$` dollar quoting are
/// respected. Comment-only fragments are dropped.
pub fn split_statements(script: &str) -> SplitScript {
    let chars: Vec<char> = script.chars().collect();
    let mut out = SplitScript::default();
    let mut state = State::Normal;
    let mut current = String::new();
    let mut has_content = false;
    let mut start_line = 1;
    let mut line = 1;
    let mut at_line_start = true;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();

        match &mut state {
            State::Normal => {
                if at_line_start && !has_content && ch == '\\' {
                    out.skipped_meta_commands.push(line);
                    while i < chars.len() && chars[i] != '\n' {
                        i += 1;
                    }
                    continue;
                }
                match ch {
                    ';' => {
                        if has_content {
                            out.statements.push(ScriptStatement {
                                sql: current.trim().to_string(),
                                line: start_line,
                            });
                        }
                        current.clear();
                        has_content = false;
                        i += 1;
                        continue;
                    }
                    '-' if next == Some('-') => state = State::LineComment,
                    '/' if next == Some('*') => {
                        current.push_str("/*");
                        state = State::BlockComment(1);
                        i += 2;
                        continue;
                    }
                    '$' => {
                        if let Some(tag) = dollar_tag(&chars, i) {
                            mark_content(&mut current, &mut has_content, &mut start_line, line);
                            current.push_str(&tag);
                            i += tag.chars().count();
                            state = State::Dollar(tag);
                            continue;
                        }
                        mark_content(&mut current, &mut has_content, &mut start_line, line);
                    }
                    '\'' => {
                        mark_content(&mut current, &mut has_content, &mut start_line, line);
                        state = State::SingleQuote;
                    }
                    '"' => {
                        mark_content(&mut current, &mut has_content, &mut start_line, line);
                        state = State::DoubleQuote;
                    }
                    c if !c.is_whitespace() => {
                        mark_content(&mut current, &mut has_content, &mut start_line, line);
                    }
                    _ => {}
                }
            }
            State::SingleQuote => {
                if ch == '\'' {
                    if next == Some('\'') {
                        current.push_str("''");
                        i += 2;
                        continue;
                    }
                    state = State::Normal;
                }
            }
            State::DoubleQuote => {
                if ch == '"' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if ch == '\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if ch == '*' && next == Some('/') {
                    *depth -= 1;
                    current.push_str("*/");
                    if *depth == 0 {
                        state = State::Normal;
                    }
                    i += 2;
                    continue;
                }
                if ch == '/' && next == Some('*') {
                    *depth += 1;
                    current.push_str("/*");
                    i += 2;
                    continue;
                }
            }
            State::Dollar(tag) => {
                if ch == '$' && matches_at(&chars, i, tag) {
                    let length = tag.chars().count();
                    current.push_str(tag);
                    i += length;
                    state = State::Normal;
                    continue;
                }
            }
        }

        if ch == '\n' {
            line += 1;
            at_line_start = true;
        } else if !ch.is_whitespace() {
            at_line_start = false;
        }
        current.push(ch);
        i += 1;
    }

    if has_content {
        out.statements.push(ScriptStatement {
            sql: current.trim().to_string(),
            line: start_line,
        });
    }

    out
}

/// Record the first real token of a statement, discarding leading comments.
fn mark_content(current: &mut String, has_content: &mut bool, start_line: &mut usize, line: usize) {
    if !*has_content {
        current.clear();
        *has_content = true;
        *start_line = line;
    }
}

/// `$tag$` opening at `start`, where tag is empty or an identifier.
fn dollar_tag(chars: &[char], start: usize) -> Option<String> {
    let mut end = start + 1;
    while let Some(ch) = chars.get(end) {
        if *ch == '$' {
            let tag: String = chars[start..=end].iter().collect();
            return Some(tag);
        }
        let valid =
            ch.is_ascii_alphabetic() || *ch == '_' || (end > start + 1 && ch.is_ascii_digit());
        if !valid {
            return None;
        }
        end += 1;
    }
    None
}

fn matches_at(chars: &[char], start: usize, tag: &str) -> bool {
    tag.chars()
        .enumerate()
        .all(|(offset, expected)| chars.get(start + offset) == Some(&expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(split: &SplitScript) -> Vec<&str> {
        split
            .statements
            .iter()
            .map(|statement| statement.sql.as_str())
            .collect()
    }

    #[test]
    fn splits_on_top_level_semicolons_only() {
        let split = split_statements(
            "insert into t values ('a;b');\ncreate table \"x;y\" (id int);\n-- done; really\n",
        );
        assert_eq!(
            sql(&split),
            vec![
                "insert into t values ('a;b')",
                "create table \"x;y\" (id int)"
            ]
        );
    }

    #[test]
    fn keeps_dollar_quoted_bodies_intact() {
        let script = "create function f() returns int as $body$\nbegin\n  return 1;\nend\n\
                      $body$ language plpgsql;\nselect 1;";
        let split = split_statements(script);
        assert_eq!(split.statements.len(), 2);
        assert!(split.statements[0].sql.contains("return 1;"));
        assert_eq!(split.statements[1].line, 6);
    }

    #[test]
    fn tracks_start_lines_past_comments() {
        let script = "/* header; still header */\n\n-- note\nselect 1;\n\n  select\n  2;";
        let split = split_statements(script);
        let lines: Vec<usize> = split.statements.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![4, 6]);
    }

    #[test]
    fn skips_psql_meta_commands() {
        let split = split_statements("\\set ON_ERROR_STOP on\nselect 1;\n\\echo done\n");
        assert_eq!(sql(&split), vec!["select 1"]);
        assert_eq!(split.skipped_meta_commands, vec![1, 3]);
    }

    #[test]
    fn escaped_quotes_do_not_end_strings() {
        let split = split_statements("select 'it''s; fine';select 2");
        assert_eq!(sql(&split), vec!["select 'it''s; fine'", "select 2"]);
    }
}
