//! Static frontend preparation.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const INDEX_TEMPLATE: &str = "index-template.html";
pub const INDEX_PAGE: &str = "index.html";

const OS_PLACEHOLDERS: [&str; 2] = ["{{.OperatingSystem}}", "{{ .OperatingSystem }}"];

/// Render `index-template.html` in `dir` into `index.html`, filling in the
/// host operating system.
///
/// Returns the written path, or `None` when the directory has no template.
pub fn render_index_page(dir: &Path, host_os: &str) -> Result<Option<PathBuf>, ConfigError> {
    let template_path = dir.join(INDEX_TEMPLATE);
    let template = match std::fs::read_to_string(&template_path) {
        Ok(template) => template,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %template_path.display(), "No index template, serving frontend as is");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let host_os = html_escape(host_os);
    let page = OS_PLACEHOLDERS
        .iter()
        .fold(template, |page, placeholder| page.replace(placeholder, &host_os));

    let index_path = dir.join(INDEX_PAGE);
    std::fs::write(&index_path, page)?;
    tracing::debug!(path = %index_path.display(), "Rendered index page");
    Ok(Some(index_path))
}

/// Escape HTML special characters so the value renders as text.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
