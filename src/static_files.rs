//! Static bundle serving for sites with an empty command
//!
//! Conventional static file server semantics over the site's `data`
//! directory: directories serve their `index.html` (or a listing when there
//! is none), MIME type comes from the file extension, anything missing is a
//! 404. Resolution is stateless, so nothing is cached on the descriptor and
//! no registry lock is taken on this path.

use crate::error::{full_body, ResponseBody};
use crate::registry::Site;
use hyper::{Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

enum Resolved {
    File(PathBuf),
    /// Directory requested without a trailing slash; redirect to `/path/`.
    RedirectToDir,
    Listing(PathBuf),
    NotFound,
}

/// Serve a request target (path, optionally with query) from the site's
/// bundle directory.
pub async fn serve(site: &Site, target: &str) -> Response<ResponseBody> {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    match resolve(&site.data, path) {
        Resolved::File(file) => match tokio::fs::read(&file).await {
            Ok(contents) => Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, mime_for_path(&file))
                .body(full_body(contents))
                .expect("static response parts are valid"),
            Err(err) => {
                debug!(site = %site.id, file = %file.display(), error = %err, "reading static file");
                not_found()
            }
        },
        Resolved::RedirectToDir => {
            let location = match query {
                Some(query) => format!("{}/?{}", path, query),
                None => format!("{}/", path),
            };
            Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(hyper::header::LOCATION, location)
                .body(full_body(""))
                .expect("static response parts are valid")
        }
        Resolved::Listing(dir) => match render_listing(&dir).await {
            Ok(html) => Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
                .body(full_body(html))
                .expect("static response parts are valid"),
            Err(err) => {
                debug!(site = %site.id, dir = %dir.display(), error = %err, "listing directory");
                not_found()
            }
        },
        Resolved::NotFound => not_found(),
    }
}

fn not_found() -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body("404 Not Found"))
        .expect("static response parts are valid")
}

fn resolve(root: &Path, request_path: &str) -> Resolved {
    let Some(rel) = sanitize(request_path) else {
        return Resolved::NotFound;
    };

    let full = root.join(&rel);

    // Canonicalize both sides so symlinks cannot lead out of the bundle.
    let Ok(canonical) = full.canonicalize() else {
        return Resolved::NotFound;
    };
    let Ok(root_canonical) = root.canonicalize() else {
        return Resolved::NotFound;
    };
    if !canonical.starts_with(&root_canonical) {
        return Resolved::NotFound;
    }

    if canonical.is_dir() {
        if !request_path.ends_with('/') {
            return Resolved::RedirectToDir;
        }
        let index = canonical.join("index.html");
        if index.is_file() {
            return Resolved::File(index);
        }
        return Resolved::Listing(canonical);
    }
    if canonical.is_file() {
        return Resolved::File(canonical);
    }
    Resolved::NotFound
}

/// Percent-decode and normalize a URL path into a relative filesystem path.
/// Rejects traversal, NUL bytes and non-normal components.
fn sanitize(request_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode(request_path)?;
    if decoded.contains('\0') {
        return None;
    }

    let rel = Path::new(decoded.trim_start_matches('/'));
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return None,
        }
    }
    Some(rel.to_path_buf())
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

async fn render_listing(dir: &Path) -> std::io::Result<String> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let mut html = String::from("<pre>\n");
    for name in names {
        let escaped = escape_html(&name);
        html.push_str(&format!("<a href=\"{}\">{}</a>\n", escaped, escaped));
    }
    html.push_str("</pre>\n");
    Ok(html)
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}
