//! External reachability probe for the public tunnel URL.

use std::time::Duration;

use tracing::debug;

/// Probe settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOptions {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub reachable: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

/// `https://{subdomain}.{public_domain}`, lowercased.
pub fn build_public_url(subdomain: &str, public_domain: &str) -> String {
    format!(
        "https://{}.{}",
        subdomain.to_lowercase(),
        public_domain.trim_matches('.')
    )
}

/// GET `{public_url}/health` until it answers with a success status.
pub async fn verify_public_url(public_url: &str, options: VerifyOptions) -> VerifyOutcome {
    let health_url = format!("{}/health", public_url.trim_end_matches('/'));
    let attempts = options.max_attempts.max(1);

    let client = match reqwest::Client::builder()
        .timeout(options.request_timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            return VerifyOutcome {
                reachable: false,
                attempts: 0,
                error: Some(e.to_string()),
            };
        }
    };

    let mut last_error = None;
    for attempt in 1..=attempts {
        match client.get(&health_url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %health_url, attempt, "Tunnel URL reachable");
                return VerifyOutcome {
                    reachable: true,
                    attempts: attempt,
                    error: None,
                };
            }
            Ok(response) => last_error = Some(format!("HTTP {}", response.status().as_u16())),
            Err(e) => last_error = Some(e.to_string()),
        }
        debug!(url = %health_url, attempt, error = ?last_error, "Tunnel URL probe failed");

        if attempt < attempts {
            tokio::time::sleep(options.retry_delay).await;
        }
    }

    VerifyOutcome {
        reachable: false,
        attempts,
        error: last_error,
    }
}
