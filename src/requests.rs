use std::{sync::Arc, time::Duration};

use anyhow::Context;
use indexmap::IndexMap;
use reqwest::{
    Client, ClientBuilder, Response, Url,
    cookie::{CookieStore, Jar},
    header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, UPGRADE_INSECURE_REQUESTS},
};
use serde::Serialize;

use crate::ratelimit::RateLimiter;

// Every portal page lives under this path.
const APP_PATH: &str = "/jsxsd/";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// HTTP client bound to one portal: shares a cookie jar across every request
/// and paces itself with a rate limiter.
pub struct RequestClient {
    client: Client,
    jar: Arc<Jar>,
    base_url: Url,
    timeout: Duration,
    rate_limiter: RateLimiter,
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("zh-CN,zh;q=0.8,en-US;q=0.5,en;q=0.3"),
    );
    headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers
}

fn build_client(jar: Arc<Jar>, timeout: Duration) -> anyhow::Result<Client> {
    let client = ClientBuilder::new()
        .cookie_provider(jar)
        .user_agent(USER_AGENT)
        .default_headers(default_headers())
        .timeout(timeout)
        .build()?;
    Ok(client)
}

impl RequestClient {
    pub fn new(base_url: &str, timeout: Duration, req_per_sec: u32) -> anyhow::Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid portal url: {base_url}"))?;
        let jar = Arc::new(Jar::default());
        let client = build_client(jar.clone(), timeout)?;
        Ok(Self {
            client,
            jar,
            base_url,
            timeout,
            rate_limiter: RateLimiter::new(req_per_sec),
        })
    }

    pub async fn get(&self, url: &str) -> anyhow::Result<Response> {
        // Wait (non-blocking) until we're allowed to make a request according
        // to our self-imposed rate-limiting policy.
        self.rate_limiter.wait_until_ready().await;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        Ok(response)
    }

    pub async fn get_with_query<Q: Serialize + ?Sized>(
        &self,
        url: &str,
        query: &Q,
    ) -> anyhow::Result<Response> {
        self.rate_limiter.wait_until_ready().await;

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        Ok(response)
    }

    pub async fn post_form<F: Serialize + ?Sized>(
        &self,
        url: &str,
        form: &F,
    ) -> anyhow::Result<Response> {
        self.rate_limiter.wait_until_ready().await;

        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        Ok(response)
    }

    pub async fn fetch_url_body(&self, url: &str) -> anyhow::Result<String> {
        let response = self.get(url).await?.error_for_status()?;
        let body = response.text().await?;
        Ok(body)
    }

    pub async fn post_form_body<F: Serialize + ?Sized>(
        &self,
        url: &str,
        form: &F,
    ) -> anyhow::Result<String> {
        let response = self.post_form(url, form).await?.error_for_status()?;
        let body = response.text().await?;
        Ok(body)
    }

    /// Cookies the jar would send anywhere on the portal, by name. Tomcat
    /// scopes `JSESSIONID` to the application path, so ask for both the root
    /// and the application. Later duplicates win.
    pub fn cookie_pairs(&self) -> IndexMap<String, String> {
        let mut pairs = IndexMap::new();
        let mut urls = vec![self.base_url.clone()];
        if let Ok(app_url) = self.base_url.join(APP_PATH) {
            urls.push(app_url);
        }
        for url in &urls {
            let Some(header) = self.jar.cookies(url) else {
                continue;
            };
            let Ok(header) = header.to_str() else {
                continue;
            };
            for pair in header.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    pairs.insert(name.to_string(), value.to_string());
                }
            }
        }
        pairs
    }

    pub fn add_cookies<'a>(&self, cookies: impl IntoIterator<Item = (&'a String, &'a String)>) {
        for (name, value) in cookies {
            self.jar
                .add_cookie_str(&format!("{name}={value}; Path=/"), &self.base_url);
        }
    }

    /// reqwest's jar can't be emptied in place, so swap in a fresh client.
    pub fn clear_cookies(&mut self) -> anyhow::Result<()> {
        let jar = Arc::new(Jar::default());
        self.client = build_client(jar.clone(), self.timeout)?;
        self.jar = jar;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookies_round_trip_through_the_jar() {
        let mut client =
            RequestClient::new("http://portal.example:8099", Duration::from_secs(5), 5).unwrap();
        assert!(client.cookie_pairs().is_empty());

        let mut cookies = IndexMap::new();
        cookies.insert("JSESSIONID".to_string(), "ABC123".to_string());
        cookies.insert("SERVERID".to_string(), "node1".to_string());
        client.add_cookies(&cookies);

        let pairs = client.cookie_pairs();
        assert_eq!(pairs.get("JSESSIONID").map(String::as_str), Some("ABC123"));
        assert_eq!(pairs.get("SERVERID").map(String::as_str), Some("node1"));

        client.clear_cookies().unwrap();
        assert!(client.cookie_pairs().is_empty());
    }

    #[test]
    fn cookies_scoped_to_the_application_path_are_exported() {
        let client =
            RequestClient::new("http://portal.example:8099", Duration::from_secs(5), 5).unwrap();
        let login_url = Url::parse("http://portal.example:8099/jsxsd/xk/LoginToXk").unwrap();
        client
            .jar
            .add_cookie_str("JSESSIONID=TOMCAT123; Path=/jsxsd; HttpOnly", &login_url);
        client
            .jar
            .add_cookie_str("SERVERID=node1; Path=/", &login_url);

        let pairs = client.cookie_pairs();
        assert_eq!(pairs.get("JSESSIONID").map(String::as_str), Some("TOMCAT123"));
        assert_eq!(pairs.get("SERVERID").map(String::as_str), Some("node1"));
        assert_eq!(pairs.len(), 2);
    }
}
