//! HTML injection for served pages: login status in the navigation, and the
//! denied / not-found fragments that replace the page's `<main>` element.
use crate::identity::Identity;
use crate::settings::AuthMode;

pub const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

const NAV_END: &str = "</nav>";
const MAIN_START: &str = "<main";
const MAIN_END: &str = "</main>";

const ASSET_EXTENSIONS: &[&str] = &["ico", "css", "js", "png", "woff", "woff2"];

/// Static assets are served untouched and without an access check.
pub fn is_asset(path: &str) -> bool {
    extension(path).is_some_and(|ext| ASSET_EXTENSIONS.iter().any(|a| ext.eq_ignore_ascii_case(a)))
}

/// Requests for the access-control document itself, which is never served.
pub fn is_policy_path(path: &str, access_file: &str) -> bool {
    let name = access_file.rsplit('/').next().unwrap_or(access_file);
    !name.is_empty() && path.ends_with(name)
}

fn extension(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next()?;
    file.rsplit_once('.').map(|(_, ext)| ext)
}

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

fn login_href(mode: AuthMode) -> &'static str {
    match mode {
        AuthMode::Oidc => "/login",
        AuthMode::Edge => "/auth",
    }
}

pub fn login_fragment(mode: AuthMode, identity: Option<&Identity>) -> String {
    match identity {
        Some(identity) => format!(
            r#"<div class="login-status"><span class="login-status__user">{}</span> <a class="login-status__link" href="/logout">Sign out</a></div>"#,
            html_escape(identity.display_name())
        ),
        None => format!(
            r#"<div class="login-status"><a class="login-status__link" href="{}">Sign in</a></div>"#,
            login_href(mode)
        ),
    }
}

pub fn denied_fragment(mode: AuthMode, identity: Option<&Identity>, path: &str, message: &str) -> String {
    let action = match identity {
        Some(_) => "<p>Your account does not have access to this page.</p>".to_string(),
        None => format!(r#"<p><a href="{}">Sign in</a> to continue.</p>"#, login_href(mode)),
    };
    format!(
        r#"<main id="main-content" class="access-denied">
<h1>Access denied</h1>
<p>You cannot view <code>{}</code>.</p>
<p class="access-denied__message">{}</p>
{}
</main>"#,
        html_escape(path),
        html_escape(message),
        action
    )
}

pub fn not_found_fragment() -> &'static str {
    r#"<main id="main-content" class="not-found">
<h1>Page not found</h1>
<p>The page you requested does not exist. <a href="/">Return to the home page</a>.</p>
</main>"#
}

/// Insert `fragment` before the first `</nav>`. Pages without navigation are unchanged.
pub fn inject_login_status(content: &str, fragment: &str) -> String {
    content.replacen(NAV_END, &format!("{fragment}{NAV_END}"), 1)
}

/// Replace the first `<main ...>...</main>` span with `fragment`.
/// Returns `None` when the page has no such span.
pub fn replace_main(content: &str, fragment: &str) -> Option<String> {
    let start = content.find(MAIN_START)?;
    let end = start + content[start..].find(MAIN_END)? + MAIN_END.len();

    let mut out = String::with_capacity(content.len() - (end - start) + fragment.len());
    out.push_str(&content[..start]);
    out.push_str(fragment);
    out.push_str(&content[end..]);
    Some(out)
}

pub fn inject_denied(content: &str, fragment: &str, path: &str) -> String {
    replace_main(content, fragment).unwrap_or_else(|| {
        tracing::debug!(%path, "No main element in page, denial not injected");
        content.to_string()
    })
}

pub fn inject_not_found(index: &str) -> String {
    replace_main(index, not_found_fragment()).unwrap_or_else(|| {
        tracing::debug!("No main element in index page, not-found not injected");
        index.to_string()
    })
}

/// Content type by file extension. Pages without one are HTML.
pub fn content_type(path: &str) -> &'static str {
    match extension(path).map(str::to_ascii_lowercase).as_deref() {
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("svg") => "image/svg+xml",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        _ => "text/html; charset=utf-8",
    }
}
