//! Chromium-driven portal using chromiumoxide.
//!
//! The window is visible: the login page carries a challenge that the
//! operator solves by hand. Downloads go straight into the run's download
//! folder, where the artifact collector picks them up.

use crate::error::{HarvestError, Result};
use crate::navigator::{LoginOutcome, Portal};
use crate::schema::{Credentials, Period, PortalProfile, RunConfig};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use log::{debug, info};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Overrides the Chromium executable chromiumoxide would pick.
pub const CHROMIUM_PATH_ENV: &str = "RECEIPT_HARVESTER_CHROMIUM";

pub struct ChromiumPortal {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    profile: PortalProfile,
    poll: Duration,
    form_url: Option<String>,
}

impl ChromiumPortal {
    /// Launches a visible browser with downloads routed to the run's
    /// download folder.
    pub async fn launch(config: &RunConfig) -> Result<Self> {
        let download_dir = config.download_dir();
        std::fs::create_dir_all(&download_dir)?;

        let mut builder = BrowserConfig::builder()
            .with_head()
            .arg("--start-maximized")
            .arg("--disable-extensions");
        if let Ok(path) = std::env::var(CHROMIUM_PATH_ENV) {
            builder = builder.chrome_executable(PathBuf::from(path));
        }
        let browser_config = builder
            .build()
            .map_err(|e| HarvestError::Portal(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(browser_config).await?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler event error: {}", e);
                }
            }
        });

        let page = browser.new_page("about:blank").await?;

        let download_path = std::fs::canonicalize(&download_dir)?;
        let behavior = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(download_path.display().to_string())
            .build()
            .map_err(HarvestError::Portal)?;
        browser.execute(behavior).await?;
        info!("Browser ready, downloads go to {}", download_path.display());

        Ok(Self {
            browser,
            page,
            handler,
            profile: config.portal.clone(),
            poll: config.timeouts.poll_interval(),
            form_url: None,
        })
    }

    async fn eval<T: DeserializeOwned>(&self, script: String) -> Result<T> {
        let result = self.page.evaluate(script).await?;
        Ok(result.into_value()?)
    }

    /// Polls until the script evaluates to `true`. Callers bound the wait.
    async fn wait_until(&self, script: String) -> Result<()> {
        loop {
            if self.eval::<bool>(script.clone()).await.unwrap_or(false) {
                return Ok(());
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    async fn wait_for(&self, selector: &str) -> Result<()> {
        self.wait_until(format!("document.querySelector({}) !== null", js(selector)))
            .await
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.wait_until(format!(
            "(() => {{ const el = document.querySelector({}); return !!el && !el.disabled; }})()",
            js(selector)
        ))
        .await?;
        self.run_checked(
            format!(
                "(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
                js(selector)
            ),
            format!("element {} disappeared before click", selector),
        )
        .await
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<()> {
        self.wait_for(selector).await?;
        self.run_checked(
            format!(
                "(() => {{ const el = document.querySelector({}); if (!el) return false; \
                 el.value = {}; el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
                 el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()",
                js(selector),
                js(value)
            ),
            format!("could not fill {}", selector),
        )
        .await
    }

    /// Evaluates a script that reports success as a boolean.
    async fn run_checked(&self, script: String, failure: String) -> Result<()> {
        if self.eval::<bool>(script).await? {
            Ok(())
        } else {
            Err(HarvestError::Portal(failure))
        }
    }

    async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }
}

/// A JavaScript string literal.
fn js(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[async_trait]
impl Portal for ChromiumPortal {
    async fn submit_credentials(&mut self, credentials: &Credentials) -> Result<LoginOutcome> {
        self.goto(&self.profile.login_url).await?;
        self.fill(&self.profile.username_field, &credentials.username)
            .await?;
        self.fill(&self.profile.password_field, &credentials.password)
            .await?;
        info!("Credentials entered, waiting for the login challenge");
        Ok(LoginOutcome::ChallengeRequired)
    }

    async fn await_challenge(&mut self) -> Result<()> {
        self.click(&self.profile.submit_button).await?;
        self.wait_until(format!(
            "document.querySelector({}) === null",
            js(&self.profile.username_field)
        ))
        .await
    }

    async fn open_query_form(&mut self) -> Result<()> {
        let closed: bool = self
            .eval(format!(
                "(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
                js(&self.profile.notice_close_button)
            ))
            .await
            .unwrap_or(false);
        if closed {
            debug!("Dismissed portal notice");
        }

        let menu = js(&self.profile.benefits_menu_text);
        self.wait_until(format!(
            "[...document.querySelectorAll('span')].some(e => e.textContent.trim() === {})",
            menu
        ))
        .await?;
        self.run_checked(
            format!(
                "(() => {{ const el = [...document.querySelectorAll('span')].find(e => e.textContent.trim() === {}); \
                 if (!el) return false; el.click(); return true; }})()",
                menu
            ),
            format!("menu entry '{}' not found", self.profile.benefits_menu_text),
        )
        .await?;

        self.click(&self.profile.receipts_link).await?;
        self.wait_until("(() => { const f = document.querySelector('iframe'); return !!f && !!f.src; })()".to_string())
            .await?;

        // The query form lives in an iframe; work on its document directly.
        let form_url: String = self
            .eval("document.querySelector('iframe').src".to_string())
            .await?;
        self.goto(&form_url).await?;
        self.wait_for(&self.profile.beneficiary_select).await?;
        info!("Query form open at {}", form_url);
        self.form_url = Some(form_url);
        Ok(())
    }

    async fn submit_query(&mut self, beneficiary: &str, period: Period) -> Result<()> {
        self.fill(&self.profile.beneficiary_select, beneficiary)
            .await?;
        self.fill(&self.profile.month_input, &period.month().to_string())
            .await?;
        self.fill(&self.profile.year_input, &period.year().to_string())
            .await?;
        self.click(&self.profile.consult_button).await
    }

    async fn rendered_page(&mut self) -> Result<String> {
        self.wait_for(&self.profile.concepts_table).await?;
        Ok(self.page.content().await?)
    }

    async fn request_artifact(&mut self) -> Result<()> {
        self.click(&self.profile.print_button).await
    }

    async fn return_to_query_form(&mut self) -> Result<()> {
        let form_url = self
            .form_url
            .clone()
            .ok_or_else(|| HarvestError::Navigation("query form was never opened".to_string()))?;
        self.goto(&form_url).await?;
        self.wait_for(&self.profile.beneficiary_select).await
    }

    async fn close(&mut self) -> Result<()> {
        self.browser.close().await?;
        self.handler.abort();
        Ok(())
    }
}
