/// Normalise an indented multi-line literal into file contents.
///
/// Leading and trailing blank lines are dropped, the indentation shared by
/// every non-blank line is removed, and the result ends in exactly one
/// newline. Text with no non-blank line becomes the empty string.
pub fn reindent(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let is_blank = |line: &&str| line.trim().is_empty();

    let Some(first) = lines.iter().position(|line| !is_blank(line)) else {
        return String::new();
    };
    let last = lines.iter().rposition(|line| !is_blank(line)).unwrap_or(first);
    let body = &lines[first..=last];

    let indent = body
        .iter()
        .filter(|line| !is_blank(line))
        .map(|line| indentation(line))
        .min()
        .unwrap_or(0);

    let mut out = String::with_capacity(text.len());
    for line in body {
        if is_blank(line) {
            out.push('\n');
            continue;
        }
        out.push_str(line.get(indent..).unwrap_or_default().trim_end());
        out.push('\n');
    }
    out
}

fn indentation(line: &str) -> usize {
    line.len() - line.trim_start_matches([' ', '\t']).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_common_indentation() {
        let text = "
            {
              \"name\": \"project\"
            }
        ";
        assert_eq!(reindent(text), "{\n  \"name\": \"project\"\n}\n");
    }

    #[test]
    fn test_keeps_inner_blank_lines() {
        let text = "\n    first\n\n    second\n    ";
        assert_eq!(reindent(text), "first\n\nsecond\n");
    }

    #[test]
    fn test_single_line_gets_one_newline() {
        assert_eq!(reindent("hello"), "hello\n");
        assert_eq!(reindent("hello\n\n\n"), "hello\n");
    }

    #[test]
    fn test_blank_text_is_empty() {
        assert_eq!(reindent(""), "");
        assert_eq!(reindent("  \n\t\n"), "");
    }

    #[test]
    fn test_tabs_count_as_indentation() {
        assert_eq!(reindent("\t\ta\n\t\t\tb"), "a\n\tb\n");
    }
}
