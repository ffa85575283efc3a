//! Contents of the synthetic project shown when no archive could be loaded.

use crate::archive::decode::FileContentMap;

pub const FALLBACK_HTML_PATH: &str = "index.html";
pub const FALLBACK_SCRIPT_PATH: &str = "main.js";

/// Returns the placeholder page for the preview iframe.
pub fn fallback_html() -> &'static str {
    r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>Game Preview</title>
</head>
<body>
  <h1>Game Preview</h1>
  <p>Game files could not be loaded.</p>
  <script src="main.js"></script>
</body>
</html>
"#
}

/// Returns the placeholder game script.
pub fn fallback_script() -> &'static str {
    r#"// Placeholder script. The generated project could not be downloaded.
console.log("Mock game file");
"#
}

/// The two-file project substituted after all load attempts fail.
pub fn fallback_files() -> FileContentMap {
    let mut files = FileContentMap::new();
    files.insert(FALLBACK_HTML_PATH.to_string(), fallback_html().to_string());
    files.insert(FALLBACK_SCRIPT_PATH.to_string(), fallback_script().to_string());
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_project_has_page_and_script() {
        let files = fallback_files();
        assert_eq!(files.len(), 2);
        assert!(files[FALLBACK_HTML_PATH].contains("Game Preview"));
        assert!(files[FALLBACK_HTML_PATH].contains(FALLBACK_SCRIPT_PATH));
        assert!(files[FALLBACK_SCRIPT_PATH].contains("console.log"));
    }
}
