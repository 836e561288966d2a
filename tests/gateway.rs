//! End-to-end tests that drive the handler through its public
//! `http::Request` -> `http::Response` interface, backed by `MemRepo`.

use std::time::Duration;

use futures_util::TryStreamExt;
use http::{Request, Response, StatusCode};

use dav_gateway::{Body, DavHandler, MemRepo};

fn handler() -> DavHandler {
    DavHandler::builder(MemRepo::new()).build()
}

fn req(method: &str, path: &str) -> http::request::Builder {
    Request::builder().method(method).uri(path)
}

async fn body_string(resp: Response<Body>) -> String {
    let chunks: Vec<bytes::Bytes> = resp.into_body().try_collect().await.unwrap();
    String::from_utf8(chunks.concat()).unwrap()
}

fn lock_token(resp: &Response<Body>) -> String {
    resp.headers()
        .get("lock-token")
        .expect("lock-token header")
        .to_str()
        .unwrap()
        .trim_matches(|c| c == '<' || c == '>')
        .to_string()
}

const LOCKINFO: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:exclusive/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
  <D:owner>tester</D:owner>
</D:lockinfo>"#;

#[tokio::test]
async fn options_advertises_dav_level_2() {
    let h = handler();
    let resp = h.handle(req("OPTIONS", "/").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("DAV").unwrap(), "1,2");
    assert_eq!(resp.headers().get("MS-Author-Via").unwrap(), "DAV");
}

#[tokio::test]
async fn put_then_get_roundtrip() {
    let h = handler();

    let resp = h
        .handle(req("PUT", "/hello.txt").body(Body::from("hello world")).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert!(resp.headers().contains_key("etag"));

    let resp = h.handle(req("GET", "/hello.txt").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("etag"));
    assert_eq!(body_string(resp).await, "hello world");

    // overwriting an existing file is 204, not 201.
    let resp = h
        .handle(req("PUT", "/hello.txt").body(Body::from("again")).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn get_on_collection_is_405_with_allow() {
    let h = handler();
    let resp = h.handle(req("MKCOL", "/dir").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = h.handle(req("GET", "/dir").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    let allow = resp.headers().get("allow").unwrap().to_str().unwrap();
    assert!(allow.contains("PROPFIND"));
}

#[tokio::test]
async fn mkcol_error_cases() {
    let h = handler();

    // missing intermediate collection.
    let resp = h.handle(req("MKCOL", "/a/b").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = h.handle(req("MKCOL", "/a").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    // the canonical collection URL gets its trailing slash back.
    assert_eq!(resp.headers().get("content-location").unwrap(), "/a/");

    let resp = h.handle(req("MKCOL", "/a").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    // MKCOL request bodies are not understood.
    let resp = h.handle(req("MKCOL", "/c").body(Body::from("x")).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn delete_collection_is_recursive() {
    let h = handler();
    h.handle(req("MKCOL", "/dir").body(Body::empty()).unwrap()).await;
    h.handle(req("PUT", "/dir/f.txt").body(Body::from("x")).unwrap()).await;

    let resp = h.handle(req("DELETE", "/dir").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = h.handle(req("GET", "/dir/f.txt").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn propfind_depth_cardinality() {
    let h = handler();
    h.handle(req("MKCOL", "/dir").body(Body::empty()).unwrap()).await;
    h.handle(req("MKCOL", "/dir/sub").body(Body::empty()).unwrap()).await;
    h.handle(req("PUT", "/dir/sub/f.txt").body(Body::from("x")).unwrap()).await;

    for (depth, responses) in [("0", 1), ("1", 2), ("infinity", 3)] {
        let resp = h
            .handle(
                req("PROPFIND", "/dir")
                    .header("depth", depth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status().as_u16(), 207);
        let body = body_string(resp).await;
        assert_eq!(
            body.matches("<D:response>").count(),
            responses,
            "depth {}",
            depth
        );
    }
}

#[tokio::test]
async fn propfind_reports_live_properties() {
    let h = handler();
    h.handle(req("PUT", "/live.txt").body(Body::from("0123456789")).unwrap()).await;

    let resp = h
        .handle(
            req("PROPFIND", "/live.txt")
                .header("depth", "0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let body = body_string(resp).await;
    assert!(body.contains("<D:getcontentlength>10</D:getcontentlength>"));
    assert!(body.contains("<D:getetag>"));
    assert!(body.contains("<D:supportedlock>"));
    assert!(body.contains("<D:lockdiscovery>"));
}

#[tokio::test]
async fn propfind_unmapped_is_404() {
    let h = handler();
    let resp = h
        .handle(req("PROPFIND", "/nope").header("depth", "0").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn proppatch_dead_property_roundtrip() {
    let h = handler();
    h.handle(req("PUT", "/doc.txt").body(Body::from("x")).unwrap()).await;

    let update = r#"<?xml version="1.0"?>
<D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example:">
  <D:set><D:prop><Z:author>jan</Z:author></D:prop></D:set>
</D:propertyupdate>"#;
    let resp = h
        .handle(req("PROPPATCH", "/doc.txt").body(Body::from(update)).unwrap())
        .await;
    assert_eq!(resp.status().as_u16(), 207);
    let body = body_string(resp).await;
    assert!(body.contains("HTTP/1.1 200"));

    let find = r#"<?xml version="1.0"?>
<D:propfind xmlns:D="DAV:" xmlns:Z="urn:example:">
  <D:prop><Z:author/></D:prop>
</D:propfind>"#;
    let resp = h
        .handle(
            req("PROPFIND", "/doc.txt")
                .header("depth", "0")
                .body(Body::from(find))
                .unwrap(),
        )
        .await;
    let body = body_string(resp).await;
    assert!(body.contains("jan"), "body: {}", body);
}

#[tokio::test]
async fn proppatch_failure_poisons_the_batch() {
    let h = handler();
    h.handle(req("PUT", "/batch.txt").body(Body::from("x")).unwrap()).await;

    // getetag is protected; its refusal must drag the dead-property
    // set and remove down to 424 with nothing applied.
    let update = r#"<?xml version="1.0"?>
<D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example:">
  <D:set><D:prop><Z:author>jan</Z:author><D:getetag>forged</D:getetag></D:prop></D:set>
  <D:remove><D:prop><Z:reviewer/></D:prop></D:remove>
</D:propertyupdate>"#;
    let resp = h
        .handle(req("PROPPATCH", "/batch.txt").body(Body::from(update)).unwrap())
        .await;
    assert_eq!(resp.status().as_u16(), 207);
    let body = body_string(resp).await;
    assert!(body.contains("HTTP/1.1 403"), "body: {}", body);
    assert!(body.contains("HTTP/1.1 424"), "body: {}", body);
    assert!(!body.contains("HTTP/1.1 200"), "body: {}", body);
    assert!(body.contains("cannot-modify-protected-property"), "body: {}", body);

    // the dead property never landed.
    let find = r#"<?xml version="1.0"?>
<D:propfind xmlns:D="DAV:" xmlns:Z="urn:example:">
  <D:prop><Z:author/></D:prop>
</D:propfind>"#;
    let resp = h
        .handle(
            req("PROPFIND", "/batch.txt")
                .header("depth", "0")
                .body(Body::from(find))
                .unwrap(),
        )
        .await;
    let body = body_string(resp).await;
    assert!(body.contains("HTTP/1.1 404"), "body: {}", body);
    assert!(!body.contains("jan"), "body: {}", body);
}

#[tokio::test]
async fn lock_blocks_writes_until_token_submitted() {
    let h = handler();
    let resp = h
        .handle(req("PUT", "/shared.txt").body(Body::from("v1")).unwrap())
        .await;
    let etag = resp.headers()["etag"].to_str().unwrap().to_string();

    let resp = h
        .handle_with(
            req("LOCK", "/shared.txt").body(Body::from(LOCKINFO)).unwrap(),
            None,
            Some("alice".to_string()),
            None,
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let token = lock_token(&resp);
    let body = body_string(resp).await;
    assert!(body.contains("<D:lockdiscovery>"));
    assert!(body.contains("exclusive"));

    // a different principal without the token is refused, with the
    // RFC 4918 precondition body naming the resource.
    let resp = h
        .handle_with(
            req("PUT", "/shared.txt").body(Body::from("v2")).unwrap(),
            None,
            Some("bob".to_string()),
            None,
        )
        .await;
    assert_eq!(resp.status().as_u16(), 423);
    let body = body_string(resp).await;
    assert!(body.contains("<D:lock-token-submitted>"), "body: {}", body);
    assert!(body.contains("/shared.txt"), "body: {}", body);

    // a matching etag condition alone is not a lock claim.
    let resp = h
        .handle_with(
            req("PUT", "/shared.txt")
                .header("if", format!("([{}])", etag))
                .body(Body::from("v2"))
                .unwrap(),
            None,
            Some("bob".to_string()),
            None,
        )
        .await;
    assert_eq!(resp.status().as_u16(), 423);

    // even the owner must present the token.
    let resp = h
        .handle_with(
            req("PUT", "/shared.txt").body(Body::from("v2")).unwrap(),
            None,
            Some("alice".to_string()),
            None,
        )
        .await;
    assert_eq!(resp.status().as_u16(), 423);

    let resp = h
        .handle_with(
            req("PUT", "/shared.txt")
                .header("if", format!("(<{}>)", token))
                .body(Body::from("v2"))
                .unwrap(),
            None,
            Some("alice".to_string()),
            None,
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    // anyone who does submit the token gets through.
    let resp = h
        .handle_with(
            req("PUT", "/shared.txt")
                .header("if", format!("(<{}>)", token))
                .body(Body::from("v3"))
                .unwrap(),
            None,
            Some("bob".to_string()),
            None,
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn lock_refresh_requires_token() {
    let h = handler();
    h.handle(req("PUT", "/r.txt").body(Body::from("x")).unwrap()).await;

    let resp = h
        .handle(req("LOCK", "/r.txt").body(Body::from(LOCKINFO)).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let token = lock_token(&resp);

    // body-less LOCK with the token refreshes.
    let resp = h
        .handle(
            req("LOCK", "/r.txt")
                .header("if", format!("(<{}>)", token))
                .header("timeout", "Second-600")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_string(resp).await;
    assert!(body.contains("Second-"));

    // without the token it is a client error.
    let resp = h
        .handle(req("LOCK", "/r.txt").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unlock_accepts_bare_token() {
    let h = handler();
    h.handle(req("PUT", "/u.txt").body(Body::from("x")).unwrap()).await;
    let resp = h
        .handle(req("LOCK", "/u.txt").body(Body::from(LOCKINFO)).unwrap())
        .await;
    let token = lock_token(&resp);

    // no angle brackets; some clients do this.
    let resp = h
        .handle(
            req("UNLOCK", "/u.txt")
                .header("lock-token", token)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn unlock_rejects_foreign_token_scheme() {
    let h = handler();
    h.handle(req("PUT", "/u2.txt").body(Body::from("x")).unwrap()).await;
    let resp = h
        .handle(
            req("UNLOCK", "/u2.txt")
                .header("lock-token", "<urn:uuid:12345>")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unlock_of_unlocked_node_is_conflict() {
    let h = handler();
    h.handle(req("PUT", "/u3.txt").body(Body::from("x")).unwrap()).await;
    let resp = h
        .handle(
            req("UNLOCK", "/u3.txt")
                .header("lock-token", "<opaquelocktoken:not:held>")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test(start_paused = true)]
async fn abandoned_lock_null_resource_is_deleted() {
    let h = handler();

    let resp = h
        .handle(
            req("LOCK", "/ghost.txt")
                .header("timeout", "Second-2")
                .body(Body::from(LOCKINFO))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = h.handle(req("GET", "/ghost.txt").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    // nobody PUTs; the provisional node times out and vanishes.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let resp = h.handle(req("GET", "/ghost.txt").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn lock_null_resource_survives_put() {
    let h = handler();

    let resp = h
        .handle(
            req("LOCK", "/draft.txt")
                .header("timeout", "Second-2")
                .body(Body::from(LOCKINFO))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let token = lock_token(&resp);

    // a PUT under the lock fills the provisional node in and reports
    // 201, not 204.
    let resp = h
        .handle(
            req("PUT", "/draft.txt")
                .header("if", format!("(<{}>)", token))
                .body(Body::from("content"))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    tokio::time::sleep(Duration::from_secs(3)).await;

    let resp = h.handle(req("GET", "/draft.txt").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "content");
}

#[tokio::test]
async fn copy_then_move() {
    let h = handler();
    h.handle(req("PUT", "/src.txt").body(Body::from("data")).unwrap()).await;

    let resp = h
        .handle(
            req("COPY", "/src.txt")
                .header("destination", "/copy.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = h.handle(req("GET", "/copy.txt").body(Body::empty()).unwrap()).await;
    assert_eq!(body_string(resp).await, "data");

    let resp = h
        .handle(
            req("MOVE", "/copy.txt")
                .header("destination", "/moved.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = h.handle(req("GET", "/copy.txt").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = h.handle(req("GET", "/moved.txt").body(Body::empty()).unwrap()).await;
    assert_eq!(body_string(resp).await, "data");
}

#[tokio::test]
async fn move_without_overwrite_is_412() {
    let h = handler();
    h.handle(req("PUT", "/one.txt").body(Body::from("1")).unwrap()).await;
    h.handle(req("PUT", "/two.txt").body(Body::from("2")).unwrap()).await;

    let resp = h
        .handle(
            req("MOVE", "/one.txt")
                .header("destination", "/two.txt")
                .header("overwrite", "F")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
}

fn etag_node_id(resp: &Response<Body>) -> String {
    let etag = resp.headers().get("etag").unwrap().to_str().unwrap();
    etag.trim_matches('"').split('_').next().unwrap().to_string()
}

#[tokio::test]
async fn rename_shuffle_preserves_node_identity() {
    let h = handler();

    let resp = h
        .handle(req("PUT", "/word.doc").body(Body::from("version 1")).unwrap())
        .await;
    let original_id = etag_node_id(&resp);

    // The office-suite save dance: new content goes to a temp file,
    // the original moves to a backup name, the temp moves into place.
    h.handle(req("PUT", "/word.tmp").body(Body::from("version 2")).unwrap()).await;

    let resp = h
        .handle(
            req("MOVE", "/word.doc")
                .header("destination", "/word.bak")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = h
        .handle(
            req("MOVE", "/word.tmp")
                .header("destination", "/word.doc")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    // the document kept its identity and got the new content.
    let resp = h.handle(req("GET", "/word.doc").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(etag_node_id(&resp), original_id);
    assert_eq!(body_string(resp).await, "version 2");

    // and the backup copy holds the old bytes.
    let resp = h.handle(req("GET", "/word.bak").body(Body::empty()).unwrap()).await;
    assert_eq!(body_string(resp).await, "version 1");
}

#[tokio::test]
async fn post_behaves_like_get() {
    let h = handler();
    h.handle(req("PUT", "/p.txt").body(Body::from("posted")).unwrap()).await;
    let resp = h.handle(req("POST", "/p.txt").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "posted");
}

#[tokio::test]
async fn put_with_stale_if_match_is_412() {
    let h = handler();
    h.handle(req("PUT", "/v.txt").body(Body::from("x")).unwrap()).await;

    let resp = h
        .handle(
            req("PUT", "/v.txt")
                .header("if-match", "\"stale_0\"")
                .body(Body::from("y"))
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn range_request_returns_partial_content() {
    let h = handler();
    h.handle(req("PUT", "/r.bin").body(Body::from("0123456789")).unwrap()).await;

    let resp = h
        .handle(
            req("GET", "/r.bin")
                .header("range", "bytes=2-5")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        resp.headers().get("content-range").unwrap(),
        "bytes 2-5/10"
    );
    assert_eq!(body_string(resp).await, "2345");
}

#[tokio::test]
async fn suffix_range_on_empty_file_is_unsatisfiable() {
    let h = handler();
    h.handle(req("PUT", "/empty.bin").body(Body::empty()).unwrap()).await;

    let resp = h
        .handle(
            req("GET", "/empty.bin")
                .header("range", "bytes=-5")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(resp.headers().get("content-range").unwrap(), "bytes */0");

    // "bytes=-0" selects nothing on any file.
    h.handle(req("PUT", "/some.bin").body(Body::from("0123456789")).unwrap()).await;
    let resp = h
        .handle(
            req("GET", "/some.bin")
                .header("range", "bytes=-0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(resp.headers().get("content-range").unwrap(), "bytes */10");
}
