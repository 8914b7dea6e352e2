//! HTTP surface (§6 External Interfaces): `/healthz`, the static web build,
//! and the `/ws` upgrade. No admin API survives from the teacher's own
//! `http.rs` (never part of this retrieval, and out of scope per the
//! gateway's Non-goals) — this module only exists to get a browser its
//! static assets and onto a WebSocket.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};

use crate::config::{GatewayConfig, Whitelist};

async fn healthz() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

async fn ws_upgrade(
    req: HttpRequest,
    stream: web::Payload,
    whitelist: web::Data<Arc<Whitelist>>,
    config: web::Data<GatewayConfig>,
) -> Result<HttpResponse, actix_web::Error> {
    let socket = crate::ws::GatewaySocket::new(whitelist.get_ref().clone(), config.get_ref().clone());
    actix_web_actors::ws::start(socket, &req, stream)
}

/// Serves one file out of `web_root`, rejecting any path that escapes it
/// via `..` and attaching the cache-control rule from §6: long-lived and
/// immutable for hashed build assets, revalidated for everything else
/// (the HTML shell in particular, so a new deploy is picked up promptly).
async fn static_file(req: HttpRequest, web_root: web::Data<PathBuf>) -> HttpResponse {
    let requested = req.match_info().query("path");
    let relative = if requested.is_empty() { "index.html" } else { requested };

    match resolve_within(web_root.get_ref(), relative) {
        Some(path) => match tokio::fs::read(&path).await {
            Ok(body) => {
                let mut response = HttpResponse::Ok();
                response.content_type(guess_content_type(&path));
                if is_immutable_asset(relative) {
                    response.insert_header(("Cache-Control", "public, max-age=31536000, immutable"));
                } else {
                    response.insert_header(("Cache-Control", "public, max-age=0, must-revalidate"));
                }
                response.body(body)
            }
            Err(_) => HttpResponse::NotFound().finish(),
        },
        None => HttpResponse::BadRequest().finish(),
    }
}

fn resolve_within(root: &Path, relative: &str) -> Option<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.components().any(|c| matches!(c, Component::ParentDir | Component::RootDir)) {
        return None;
    }
    Some(root.join(candidate))
}

fn is_immutable_asset(relative: &str) -> bool {
    relative.starts_with("_next/static/") || relative.starts_with("assets/")
}

fn guess_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("wasm") => "application/wasm",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// Optionally attaches `Cross-Origin-Opener-Policy`/`Cross-Origin-Embedder-Policy`
/// headers (§6), required by browsers that want `SharedArrayBuffer` for a
/// WASM Opus decoder.
fn coop_coep_middleware(
    enabled: bool,
) -> actix_web::middleware::DefaultHeaders {
    if enabled {
        actix_web::middleware::DefaultHeaders::new()
            .add(("Cross-Origin-Opener-Policy", "same-origin"))
            .add(("Cross-Origin-Embedder-Policy", "require-corp"))
    } else {
        actix_web::middleware::DefaultHeaders::new()
    }
}

pub async fn run(whitelist: Arc<Whitelist>, config: GatewayConfig) -> std::io::Result<()> {
    let port = config.port;
    let web_root = config.web_root.clone();
    let coop_coep = config.coop_coep;

    tracing::info!(port, web_root = %web_root.display(), "gateway http server starting");

    HttpServer::new(move || {
        App::new()
            .wrap(coop_coep_middleware(coop_coep))
            .app_data(web::Data::new(whitelist.clone()))
            .app_data(web::Data::new(config.clone()))
            .app_data(web::Data::new(web_root.clone()))
            .route("/healthz", web::get().to(healthz))
            .route("/ws", web::get().to(ws_upgrade))
            .route("/{path:.*}", web::get().to(static_file))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_within_joins_a_plain_relative_path() {
        let root = Path::new("/srv/web");
        assert_eq!(resolve_within(root, "assets/app.js"), Some(PathBuf::from("/srv/web/assets/app.js")));
    }

    #[test]
    fn resolve_within_rejects_parent_dir_traversal() {
        let root = Path::new("/srv/web");
        assert_eq!(resolve_within(root, "../etc/passwd"), None);
        assert_eq!(resolve_within(root, "assets/../../etc/passwd"), None);
    }

    #[test]
    fn resolve_within_rejects_absolute_path_component() {
        let root = Path::new("/srv/web");
        assert_eq!(resolve_within(root, "/etc/passwd"), None);
    }

    #[test]
    fn is_immutable_asset_matches_hashed_build_dirs_only() {
        assert!(is_immutable_asset("_next/static/chunk.js"));
        assert!(is_immutable_asset("assets/logo.png"));
        assert!(!is_immutable_asset("index.html"));
        assert!(!is_immutable_asset("favicon.ico"));
    }

    #[test]
    fn guess_content_type_covers_known_extensions() {
        assert_eq!(guess_content_type(Path::new("a.js")), "text/javascript; charset=utf-8");
        assert_eq!(guess_content_type(Path::new("a.wasm")), "application/wasm");
        assert_eq!(guess_content_type(Path::new("a.unknown")), "application/octet-stream");
    }
}
