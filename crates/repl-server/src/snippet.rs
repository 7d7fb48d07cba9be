/// Split Lean source into its import header and the remaining body.
///
/// The header is the run of leading `import` lines (blank lines in between
/// are skipped). Snippets sharing a header can share a primed REPL.
pub fn split_header(code: &str) -> (String, String) {
    let mut imports = Vec::new();
    let mut rest = code;

    while !rest.is_empty() {
        let (line, tail) = match rest.find('\n') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            rest = tail;
        } else if trimmed.starts_with("import ") {
            imports.push(trimmed);
            rest = tail;
        } else {
            break;
        }
    }

    (imports.join("\n"), rest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imports_become_header() {
        let (header, body) = split_header("import Mathlib\nimport Aesop\n\ntheorem t : True := trivial\n");
        assert_eq!(header, "import Mathlib\nimport Aesop");
        assert_eq!(body, "theorem t : True := trivial\n");
    }

    #[test]
    fn no_imports() {
        let (header, body) = split_header("#eval 1 + 1");
        assert_eq!(header, "");
        assert_eq!(body, "#eval 1 + 1");
    }

    #[test]
    fn only_imports() {
        let (header, body) = split_header("import Lean\n");
        assert_eq!(header, "import Lean");
        assert_eq!(body, "");
    }

    #[test]
    fn later_imports_stay_in_body() {
        let (header, body) = split_header("import Lean\nopen Nat\nimport Foo\n");
        assert_eq!(header, "import Lean");
        assert_eq!(body, "open Nat\nimport Foo\n");
    }

    #[test]
    fn identifier_named_import_is_not_header() {
        let (header, body) = split_header("importantLemma\n");
        assert_eq!(header, "");
        assert_eq!(body, "importantLemma\n");
    }
}
