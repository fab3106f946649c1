use std::sync::Arc;

use cloudflare_mcp_runtime::{App, RuntimeServices};
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub services: RuntimeServices,
    /// Present when per-user state lives in Postgres.
    pub db: Option<PgPool>,
    pub api_url: String,
    pub apps: Arc<[App]>,
}

impl AppState {
    pub fn serves(&self, app: App) -> bool {
        self.apps.contains(&app)
    }

    /// The app behind the bare `/mcp` path. Only defined when a single app is
    /// served.
    pub fn default_app(&self) -> Option<App> {
        match &*self.apps {
            [app] => Some(*app),
            _ => None,
        }
    }
}

/// Parse `CLOUDFLARE_MCP_APPS`, a comma list of app slugs. Unset or blank
/// serves every app.
pub fn parse_apps(raw: Option<&str>) -> Result<Vec<App>, String> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(App::ALL.to_vec());
    };

    let mut apps = Vec::new();
    for slug in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let app = App::from_slug(slug).ok_or_else(|| {
            let known: Vec<&str> = App::ALL.iter().map(|app| app.slug()).collect();
            format!("Unknown app '{slug}' (known: {})", known.join(", "))
        })?;
        if !apps.contains(&app) {
            apps.push(app);
        }
    }
    Ok(apps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_serves_every_app() {
        assert_eq!(parse_apps(None).unwrap().len(), App::ALL.len());
        assert_eq!(parse_apps(Some("  ")).unwrap().len(), App::ALL.len());
    }

    #[test]
    fn slugs_are_parsed_and_deduplicated() {
        let apps = parse_apps(Some("browser, autorag,browser")).unwrap();
        assert_eq!(apps, vec![App::Browser, App::Autorag]);
    }

    #[test]
    fn unknown_slug_is_rejected() {
        let err = parse_apps(Some("browser,radar")).unwrap_err();
        assert!(err.contains("radar"));
        assert!(err.contains("workers-builds"));
    }
}
