use std::fmt::Write;
use std::path::Path;

use crate::settings::UiSettings;

pub const RESOURCE_PREFIX: &str = "/resources";

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn is_external(href: &str) -> bool {
    href.starts_with("http://") || href.starts_with("https://") || href.starts_with("//")
}

/// Where a head resource is served from. Local names live under `/resources` and
/// use their `.min` sibling when minifying and one exists in the resource directory.
pub fn resource_href(ui: &UiSettings, name: &str) -> String {
    if is_external(name) {
        return name.to_string();
    }
    let name = name.trim_start_matches('/');
    if ui.minify_resources() {
        if let Some(min) = minified_name(name) {
            if ui.resource_dir.join(&min).is_file() {
                return format!("{}/{}", RESOURCE_PREFIX, min);
            }
        }
    }
    format!("{}/{}", RESOURCE_PREFIX, name)
}

fn minified_name(name: &str) -> Option<String> {
    let path = Path::new(name);
    let stem = path.file_stem()?.to_str()?;
    let ext = path.extension()?.to_str()?;
    if stem.ends_with(".min") {
        return None;
    }
    let min = format!("{}.min.{}", stem, ext);
    Some(match path.parent().and_then(Path::to_str) {
        Some(dir) if !dir.is_empty() => format!("{}/{}", dir, min),
        _ => min,
    })
}

/// A full document around a page body.
pub fn layout(ui: &UiSettings, page_id: &str, title: &str, body: &str, messages: &[String]) -> String {
    let mut html = String::from("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    let _ = writeln!(html, "<title>{}</title>", escape(title));
    for css in &ui.css_resources {
        let _ = writeln!(
            html,
            "<link rel=\"stylesheet\" type=\"text/css\" href=\"{}\">",
            escape(&resource_href(ui, css))
        );
    }
    for js in &ui.js_resources {
        let _ = writeln!(
            html,
            "<script type=\"text/javascript\" src=\"{}\"></script>",
            escape(&resource_href(ui, js))
        );
    }
    html.push_str("</head>\n");

    if ui.strip_markup_ids() {
        html.push_str("<body>\n");
    } else {
        let _ = writeln!(html, "<body data-page=\"{}\">", escape(page_id));
    }

    if !messages.is_empty() {
        html.push_str("<ul class=\"feedback\">\n");
        for message in messages {
            let _ = writeln!(html, "<li>{}</li>", escape(message));
        }
        html.push_str("</ul>\n");
    }

    html.push_str(body);
    html.push('\n');

    if ui.debug_toolbar() {
        let _ = writeln!(
            html,
            "<div class=\"debug-bar\">page: {} | development mode</div>",
            escape(page_id)
        );
    }
    html.push_str("</body>\n</html>\n");
    html
}

/// The page shown when nothing better is configured for a failed request.
pub fn error_body(status: u16, detail: Option<&str>) -> String {
    let mut body = format!("<h1>Error {}</h1>\n<p>Something went wrong.</p>", status);
    if let Some(detail) = detail {
        let _ = write!(body, "\n<pre>{}</pre>", escape(detail));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_escape() {
        assert_eq!(
            escape("<a href=\"x\">Tom & Jerry's</a>"),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; Jerry&#39;s&lt;/a&gt;"
        );
    }

    #[test]
    fn test_minified_resources_are_preferred_when_present() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.min.css"), "body{}").unwrap();
        let mut ui = UiSettings {
            resource_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        assert_eq!(resource_href(&ui, "app.css"), "/resources/app.min.css");
        assert_eq!(resource_href(&ui, "app.js"), "/resources/app.js");
        assert_eq!(
            resource_href(&ui, "//cdn.example.com/x.js"),
            "//cdn.example.com/x.js"
        );

        ui.minify_resources = Some(false);
        assert_eq!(resource_href(&ui, "app.css"), "/resources/app.css");
    }

    #[test]
    fn test_layout_in_development() {
        let ui = UiSettings {
            strip_markup_ids: Some(false),
            debug_toolbar: Some(true),
            css_resources: vec!["crm.css".to_string()],
            ..Default::default()
        };
        let html = layout(&ui, "people", "People", "<p>hi</p>", &["Saved".to_string()]);

        assert!(html.contains("<title>People</title>"));
        assert!(html.contains("href=\"/resources/crm.css\""));
        assert!(html.contains("<body data-page=\"people\">"));
        assert!(html.contains("<li>Saved</li>"));
        assert!(html.contains("class=\"debug-bar\""));
    }

    #[test]
    fn test_error_body_hides_detail_unless_given() {
        assert!(!error_body(500, None).contains("<pre>"));
        assert!(error_body(500, Some("boom <1>")).contains("<pre>boom &lt;1&gt;</pre>"));
    }
}
