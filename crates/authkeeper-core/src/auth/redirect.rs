use tracing::info;

/// Navigates the user to the login entry point after a terminal failure.
pub trait LoginRedirect: Send + Sync {
    fn redirect_to_login(&self, login_url: &str);
}

/// Redirect that only records the event in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRedirect;

impl LoginRedirect for LogRedirect {
    fn redirect_to_login(&self, login_url: &str) {
        info!(login_url, "Session ended, login required");
    }
}
