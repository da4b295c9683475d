// src/core/report.rs

use crate::core::session::SessionSnapshot;
use color_eyre::eyre::{Result, WrapErr};
use std::path::Path;

/// Report template compiled into the binary.
pub const DEFAULT_TEMPLATE: &str = include_str!("../../static/report_template.html");

/// Marker replaced by the session's JSON.
pub const SESSION_PLACEHOLDER: &str = "{{SESSION_JSON}}";

pub struct ReportRenderer {
    template: String,
}

impl Default for ReportRenderer {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl ReportRenderer {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Uses the template at `path`, or the built-in one when `path` is `None`.
    pub fn from_path(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let template = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("can't read report template {}", path.display()))?;
                Ok(Self::new(template))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn render(&self, snapshot: &SessionSnapshot) -> Result<String> {
        let json = serde_json::to_string(snapshot).wrap_err("serializing session for report")?;
        // The JSON lands inside a <script> element.
        let json = json.replace("</", "<\\/");
        Ok(self.template.replace(SESSION_PLACEHOLDER, &json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::PageRecord;

    #[test]
    fn test_default_template_has_placeholder() {
        assert!(DEFAULT_TEMPLATE.contains(SESSION_PLACEHOLDER));
    }

    #[test]
    fn test_render_embeds_snapshot() {
        let mut snapshot = SessionSnapshot {
            version: "0.2.0".into(),
            ..Default::default()
        };
        snapshot.pages.insert(
            "http://example.com/".into(),
            PageRecord {
                url: "http://example.com/".into(),
                page_title: "</script><b>".into(),
                ..Default::default()
            },
        );
        let html = ReportRenderer::new("<script>const s = {{SESSION_JSON}};</script>")
            .render(&snapshot)
            .unwrap();
        assert!(html.starts_with("<script>const s = {"));
        assert!(html.contains("\"version\":\"0.2.0\""));
        assert!(html.contains("<\\/script><b>"));
        assert_eq!(html.matches("</script>").count(), 1);
    }
}
