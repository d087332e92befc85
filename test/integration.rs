// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::ServiceFixture;

use anyhow::Result;
use indoc::indoc;
use nixopus::{
    config::Settings,
    env::EnvFile,
    proxy::{Payload, ProxyTarget, PublishError, Publisher, PublisherConfig},
    writer::ConfigWriter,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::{path::PathBuf, time::Duration};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

#[test]
fn set_entries_in_existing_env_file() -> Result<()> {
    let fixture = ServiceFixture::new(Some(indoc! {r#"
        # managed by nixopus
        PORT=8443
        DB_HOST=db
    "#}))?;

    let mut env: EnvFile = fixture.read()?.parse()?;
    env.set("PORT", "9000")?;
    env.set("REDIS_URL", "redis://redis:6379")?;
    ConfigWriter::new().write(fixture.env_file(), env.as_map())?;

    let expect = indoc! {r#"
        DB_HOST=db
        PORT=9000
        REDIS_URL=redis://redis:6379
    "#};
    assert_eq!(fixture.read()?, expect);
    assert_eq!(fixture.leftovers()?, vec![".env"]);

    Ok(())
}

#[test]
fn write_new_env_file_from_scratch() -> Result<()> {
    let fixture = ServiceFixture::new(None)?;

    let mut env = EnvFile::new();
    env.set("B", "2")?;
    env.set("A", "1")?;
    ConfigWriter::new().write(fixture.env_file(), env.as_map())?;

    assert_eq!(fixture.read()?, "A=1\nB=2\n");
    assert_eq!(fixture.read()?.parse::<EnvFile>()?, env);

    Ok(())
}

fn settings_for(server: &MockServer) -> Result<Settings> {
    let mut settings: Settings = indoc! {r#"
        [proxy]
        probe_timeout_ms = 100
        request_timeout_ms = 1000

        [proxy.readiness]
        max_attempts = 0
        base_delay_ms = 10
        timeout_ms = 500

        [proxy.publish]
        max_attempts = 3
        base_delay_ms = 10
        multiplier = 2.0
    "#}
    .parse()?;
    settings.proxy.admin_url = server.uri();

    Ok(settings)
}

#[tokio::test]
async fn load_proxy_configuration_from_file() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/load"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/load"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let file = dir.path().join("caddy.json");
    std::fs::write(&file, json!({"apps": {"http": {"servers": {}}}}).to_string())?;

    let settings = settings_for(&server)?;
    let target = ProxyTarget::new(&settings.proxy.admin_url);
    Publisher::new(PublisherConfig::from(&settings.proxy))?
        .publish(&target, Payload::File(file))
        .await?;

    Ok(())
}

#[tokio::test]
async fn missing_payload_file_is_reported_without_contacting_proxy() -> Result<()> {
    let server = MockServer::start().await;
    let settings = settings_for(&server)?;
    let publisher = Publisher::new(PublisherConfig::from(&settings.proxy))?;

    let result = publisher
        .publish(
            &ProxyTarget::new(server.uri()),
            Payload::File(PathBuf::from("/definitely/not/here.json")),
        )
        .await;

    assert!(matches!(result, Err(PublishError::ReadPayload { .. })));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());

    Ok(())
}

#[tokio::test]
async fn proxy_status_reflects_admin_api() -> Result<()> {
    let server = MockServer::start().await;
    let settings = settings_for(&server)?;
    let publisher = Publisher::new(PublisherConfig::from(&settings.proxy))?;
    let target = ProxyTarget::new(server.uri());

    // Nothing mounted yet, so wiremock answers 404: up, but unconfigured.
    assert!(publisher.is_ready(&target).await);

    Mock::given(method("GET"))
        .and(path("/config/"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;
    assert!(!publisher.is_ready(&target).await);

    Ok(())
}
