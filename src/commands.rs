//! Operator commands run by the `artifact-cache` binary.
//!
//! Each command runs in its own request scope and drains that request's
//! background work before reporting, so a finished command means every store
//! write and purge has settled.

use std::path::Path;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::cache::{
    Artifact, ArtifactBody, CacheHandler, CacheHit, DrainReport, GetContext, RequestContext,
    Revalidate, SetContext, now_millis, with_request_scope,
};
use crate::config::{Command, GetArgs, PutArgs, PutKind, RevalidateArgs};
use crate::infra::error::InfraError;

/// Result of one command, printed as JSON.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReport {
    pub request_id: Uuid,
    pub result: Value,
    pub background: DrainReport,
}

/// Run `command` in a fresh request scope and wait for its background work.
pub async fn execute(handler: &CacheHandler, command: &Command) -> Result<CommandReport, InfraError> {
    let request = RequestContext::new();
    let result = with_request_scope(request.clone(), async {
        match command {
            Command::Get(args) => Ok(get(handler, &request, args).await),
            Command::Put(args) => put(handler, &request, args).await,
            Command::Revalidate(args) => Ok(revalidate(handler, &request, args)),
        }
    })
    .await?;

    let background = request.background().drain_all().await;
    info!(
        request_id = %request.id(),
        completed = background.completed,
        failed = background.failed,
        "command finished"
    );

    Ok(CommandReport {
        request_id: request.id(),
        result,
        background,
    })
}

async fn get(handler: &CacheHandler, request: &RequestContext, args: &GetArgs) -> Value {
    let context = GetContext {
        tags: args.tags.clone(),
        soft_tags: args.soft_tags.clone(),
        allow_stale: args.allow_stale,
    };

    match handler.get(request, &args.key, &context).await {
        Some(hit) => describe_hit(&hit),
        None => json!({ "key": args.key, "outcome": "miss" }),
    }
}

fn describe_hit(hit: &CacheHit) -> Value {
    let entry = &hit.entry;
    let body_bytes = match entry.body() {
        ArtifactBody::Route { body, .. } | ArtifactBody::Fetch { body, .. } => body.len(),
        ArtifactBody::Page { html, .. } => html.len(),
        ArtifactBody::AppPage { html, rsc_data, .. } => html.len() + rsc_data.len(),
    };

    json!({
        "key": entry.key(),
        "outcome": if hit.is_stale() { "stale" } else { "hit" },
        "kind": entry.kind().as_str(),
        "status": entry.status(),
        "lastModified": entry.last_modified(),
        "ageMs": hit.age(now_millis()).map(|age| age.as_millis() as u64),
        "tags": entry.tags(),
        "headers": entry.headers(),
        "bodyBytes": body_bytes,
    })
}

async fn put(
    handler: &CacheHandler,
    request: &RequestContext,
    args: &PutArgs,
) -> Result<Value, InfraError> {
    let artifact = read_artifact(args, &args.file).await?;
    let context = SetContext {
        tags: args.tags.clone(),
        on_demand: args.on_demand,
    };

    let entry = handler.set(request, &args.key, artifact, &context);
    Ok(json!({
        "key": entry.key(),
        "kind": entry.kind().as_str(),
        "lastModified": entry.last_modified(),
        "tags": entry.tags(),
    }))
}

async fn read_artifact(args: &PutArgs, path: &Path) -> Result<Artifact, InfraError> {
    let data = Bytes::from(tokio::fs::read(path).await?);

    let artifact = match args.kind {
        PutKind::Route => Artifact::route(data, args.status),
        PutKind::Page => Artifact::new(ArtifactBody::Page {
            html: String::from_utf8_lossy(&data).into_owned(),
            page_data: Value::Null,
            status: Some(args.status),
        }),
        PutKind::Fetch => Artifact::fetch(
            data,
            args.status,
            args.url.clone().unwrap_or_else(|| args.key.clone()),
        ),
    };

    let artifact = match args.content_type.as_deref() {
        Some(content_type) => artifact.with_header("content-type", content_type),
        None => artifact,
    };
    let revalidate = args.revalidate.map_or(Revalidate::Never, Revalidate::After);
    Ok(artifact.with_revalidate(revalidate))
}

fn revalidate(handler: &CacheHandler, request: &RequestContext, args: &RevalidateArgs) -> Value {
    handler.revalidate_tag(request, args.tags.iter().cloned());
    json!({ "revalidated": args.tags })
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use clap::Parser;

    use super::*;
    use crate::cache::{CacheConfig, MemoryBlobStore, NoopPurger, StoreClient};
    use crate::config::CliArgs;

    fn handler() -> CacheHandler {
        CacheHandler::new(
            StoreClient::new(Arc::new(MemoryBlobStore::new())),
            &CacheConfig::default(),
            Arc::new(NoopPurger),
        )
    }

    fn command(args: &[&str]) -> Command {
        let mut argv = vec!["artifact-cache"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv).command
    }

    #[tokio::test]
    async fn put_then_get_across_commands() {
        let handler = handler();
        let mut file = tempfile::NamedTempFile::new().expect("tmp file");
        file.write_all(b"<html>post</html>").expect("write");
        let path = file.path().to_string_lossy().to_string();

        let report = execute(
            &handler,
            &command(&["put", "/blog/post-1", "--kind", "page", "--file", &path, "--revalidate", "60"]),
        )
        .await
        .expect("put");
        assert_eq!(report.background, DrainReport { completed: 1, failed: 0 });
        assert_eq!(report.result["kind"], "PAGE");

        let report = execute(&handler, &command(&["get", "/blog/post-1"]))
            .await
            .expect("get");
        assert_eq!(report.result["outcome"], "hit");
        assert_eq!(report.result["bodyBytes"], 17);
    }

    #[tokio::test]
    async fn revalidate_hides_entries_from_later_commands() {
        let handler = handler();
        let mut file = tempfile::NamedTempFile::new().expect("tmp file");
        file.write_all(b"{}").expect("write");
        let path = file.path().to_string_lossy().to_string();

        execute(
            &handler,
            &command(&["put", "/api/posts", "--kind", "route", "--file", &path, "--tag", "posts"]),
        )
        .await
        .expect("put");

        let report = execute(&handler, &command(&["revalidate", "posts"]))
            .await
            .expect("revalidate");
        assert_eq!(report.result["revalidated"], json!(["posts"]));
        assert_eq!(report.background.completed, 2);

        let report = execute(&handler, &command(&["get", "/api/posts"]))
            .await
            .expect("get");
        assert_eq!(report.result["outcome"], "miss");

        let report = execute(&handler, &command(&["get", "/api/posts", "--allow-stale"]))
            .await
            .expect("get");
        assert_eq!(report.result["outcome"], "stale");
    }

    #[tokio::test]
    async fn missing_input_files_are_reported() {
        let error = execute(
            &handler(),
            &command(&["put", "/a", "--kind", "route", "--file", "/nonexistent/artifact"]),
        )
        .await
        .expect_err("missing file");
        assert!(matches!(error, InfraError::Io(_)));
    }
}
