//! hCaptcha pre-check for the mutating instance endpoints. Sits in front
//! of start/stop, never inside the lifecycle core, and is disabled
//! entirely unless both the secret and the site key are configured.

use log::error;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    config::Config,
    error::{Error, Result},
};

const VERIFY_URL: &str = "https://hcaptcha.com/siteverify";

#[derive(Debug, Default, Deserialize)]
pub struct CaptchaForm {
    #[serde(default)]
    pub captcha: Option<String>,
}

impl CaptchaForm {
    pub async fn validate(
        &self,
        config: &Config,
        client: &reqwest::Client,
        remote_ip: Option<&str>,
    ) -> Result<()> {
        if !config.captcha_enabled() {
            return Ok(());
        }

        let Some(response) = self.captcha.as_deref() else {
            return Err(Error::CaptchaMissing);
        };

        if verify_hcaptcha(config, client, response, remote_ip).await? {
            Ok(())
        } else {
            Err(Error::CaptchaFailed)
        }
    }
}

async fn verify_hcaptcha(
    config: &Config,
    client: &reqwest::Client,
    response: &str,
    remote_ip: Option<&str>,
) -> Result<bool> {
    let Some(secret) = config.hcaptcha_secret.as_deref() else {
        error!("HCaptcha secret is not set!");
        return Ok(false);
    };

    let mut form = vec![("secret", secret), ("response", response)];
    if let Some(remote_ip) = remote_ip {
        form.push(("remoteip", remote_ip));
    }

    let reply = client
        .post(VERIFY_URL)
        .form(&form)
        .send()
        .await?
        .error_for_status()?;
    let body: Value = reply.json().await?;
    Ok(body.get("success").and_then(Value::as_bool).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_captcha_accepts_missing_responses() {
        let config = Config::for_tests();
        let client = reqwest::Client::new();
        let form = CaptchaForm { captcha: None };
        assert!(form.validate(&config, &client, None).await.is_ok());
    }

    #[tokio::test]
    async fn enabled_captcha_requires_a_response() {
        let mut config = Config::for_tests();
        config.hcaptcha_secret = Some("secret".to_owned());
        config.hcaptcha_site_key = Some("site".to_owned());
        let client = reqwest::Client::new();

        let form = CaptchaForm { captcha: None };
        let result = form.validate(&config, &client, None).await;
        assert!(matches!(result, Err(Error::CaptchaMissing)));
    }
}
