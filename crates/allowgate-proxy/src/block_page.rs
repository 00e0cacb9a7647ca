//! Blocked-page rendering.
//!
//! The page is a template file in the data directory with a `{website}`
//! placeholder. It is read on every render so edits show up without a
//! restart. If the file cannot be read a fixed message is served instead.

use std::fs;
use std::path::{Path, PathBuf};

use allowgate_storage::DataDir;

use crate::error::Result;

/// Body served when the template cannot be rendered.
pub const FALLBACK_MESSAGE: &str = "The site is blocked by the proxy.";

/// Placeholder replaced with the blocked host.
const WEBSITE_PLACEHOLDER: &str = "{website}";

/// Template installed on first run.
pub const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Blocked by Allowgate</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: linear-gradient(135deg, #3a6073 0%, #16222a 100%);
            color: white;
        }
        .container {
            text-align: center;
            padding: 2rem;
            max-width: 500px;
        }
        h1 {
            margin: 0 0 1rem 0;
            font-size: 2rem;
        }
        p {
            margin: 0.5rem 0;
            opacity: 0.9;
        }
        form {
            background: rgba(255,255,255,0.15);
            padding: 1rem;
            border-radius: 8px;
            margin-top: 1rem;
        }
        textarea {
            width: 100%;
            min-height: 4rem;
            box-sizing: border-box;
        }
    </style>
</head>
<body>
    <div class="container">
        <h1>Site Blocked</h1>
        <p><strong>{website}</strong> is not on the whitelist.</p>
        <form id="request">
            <p>Need access? Tell the administrator why.</p>
            <textarea id="description" placeholder="What do you need this site for?"></textarea>
            <p><button type="submit">Request access</button></p>
            <p id="status"></p>
        </form>
    </div>
    <script>
        document.getElementById('request').addEventListener('submit', function (e) {
            e.preventDefault();
            fetch('/request_whitelist', {
                method: 'POST',
                headers: { 'Content-Type': 'application/json' },
                body: JSON.stringify({
                    domain: '{website}',
                    description: document.getElementById('description').value
                })
            }).then(function (r) {
                document.getElementById('status').textContent =
                    r.ok ? 'Request sent.' : 'Request failed.';
            });
        });
    </script>
</body>
</html>
"#;

/// Renders the blocked page from its template file.
#[derive(Debug, Clone)]
pub struct BlockPage {
    template_path: PathBuf,
}

impl BlockPage {
    /// Creates a renderer reading the given template file.
    pub fn new(template_path: impl AsRef<Path>) -> Self {
        Self {
            template_path: template_path.as_ref().to_path_buf(),
        }
    }

    /// Creates a renderer reading the data directory's template.
    pub fn open(data_dir: &DataDir) -> Self {
        Self::new(data_dir.block_page_path())
    }

    pub fn template_path(&self) -> &Path {
        &self.template_path
    }

    /// Installs the default template if none exists. Returns `true` if written.
    pub fn ensure_template(&self) -> Result<bool> {
        if self.template_path.exists() {
            return Ok(false);
        }

        if let Some(parent) = self.template_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.template_path, DEFAULT_TEMPLATE)?;
        tracing::info!("Installed default blocked page at {:?}", self.template_path);

        Ok(true)
    }

    /// Renders the template for the given host.
    pub fn render(&self, website: &str) -> Result<String> {
        let template = fs::read_to_string(&self.template_path)?;
        Ok(template.replace(WEBSITE_PLACEHOLDER, &escape_html(website)))
    }

    /// Renders the template on the blocking pool, falling back to
    /// [`FALLBACK_MESSAGE`] on failure.
    pub async fn render_or_fallback(&self, website: &str) -> Vec<u8> {
        let page = self.clone();
        let website = website.to_string();
        let rendered = tokio::task::spawn_blocking(move || page.render(&website)).await;

        match rendered {
            Ok(Ok(html)) => html.into_bytes(),
            Ok(Err(e)) => {
                tracing::warn!(
                    "Failed to render blocked page from {:?}: {}",
                    self.template_path,
                    e
                );
                FALLBACK_MESSAGE.as_bytes().to_vec()
            }
            Err(e) => {
                tracing::warn!("Blocked page render task failed: {}", e);
                FALLBACK_MESSAGE.as_bytes().to_vec()
            }
        }
    }
}

/// Escapes text for inclusion in HTML element content and quoted attributes
/// or string literals.
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
