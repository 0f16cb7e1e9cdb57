mod support;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use http_body_util::BodyExt;
use support::server;

use courier::{Client, Context};

#[tokio::test]
async fn auto_headers() {
    let _ = tracing_subscriber::fmt::try_init();

    let server = server::http(move |req| async move {
        assert_eq!(req.method(), "GET");

        assert_eq!(req.headers()["accept"], "*/*");
        assert!(req.headers()["user-agent"]
            .to_str()
            .unwrap()
            .starts_with("courier/"));
        assert!(req.headers().get("host").is_some());

        http::Response::builder().body(server::empty()).unwrap()
    });

    let url = format!("http://{}/1", server.addr());
    let res = Client::new().get(&url).send().await.unwrap();

    assert_eq!(res.uri().to_string(), url);
    assert_eq!(res.status(), courier::StatusCode::OK);
}

#[tokio::test]
async fn user_agent_override() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["user-agent"], "courier-test-agent");
        http::Response::builder().body(server::empty()).unwrap()
    });

    let res = Client::builder()
        .user_agent("courier-test-agent")
        .build()
        .unwrap()
        .get(format!("http://{}/ua", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);
}

#[tokio::test]
async fn default_headers_fill_the_gaps() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["x-tenant"], "alpha");
        assert_eq!(req.headers()["x-request"], "explicit");
        http::Response::builder().body(server::empty()).unwrap()
    });

    let mut headers = http::HeaderMap::new();
    headers.insert("x-tenant", "alpha".parse().unwrap());
    headers.insert("x-request", "default".parse().unwrap());

    let res = Client::builder()
        .default_headers(headers)
        .build()
        .unwrap()
        .get(format!("http://{}/defaults", server.addr()))
        .header("x-request", "explicit")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);
}

#[tokio::test]
async fn echo_post_body() {
    let server = server::http(move |mut req| async move {
        assert_eq!(req.method(), "POST");
        let mut full = Vec::new();
        while let Some(frame) = req.body_mut().frame().await {
            if let Ok(data) = frame.unwrap().into_data() {
                full.extend(&*data);
            }
        }
        http::Response::builder()
            .body(server::body(full))
            .unwrap()
    });

    let payload = "some payload to echo back";
    let res = Client::new()
        .post(format!("http://{}/echo", server.addr()))
        .body(payload)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), payload);
}

#[tokio::test]
async fn keep_alive_reuses_the_connection() {
    let server = server::http(move |req| async move {
        let path = req.uri().path().to_owned();
        http::Response::builder()
            .body(server::body(path))
            .unwrap()
    });

    let client = Client::new();
    let base = format!("http://{}", server.addr());

    let first = client.get(format!("{base}/1")).send().await.unwrap();
    assert_eq!(first.text().await.unwrap(), "/1");

    let route = client.route_for(format!("{base}/")).unwrap();
    assert_eq!(client.pool_stats_for(&route).available, 1);

    let ctx = Context::new();
    let second = client
        .get(format!("{base}/2"))
        .context(ctx.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(second.text().await.unwrap(), "/2");

    let endpoint = ctx.endpoint().expect("endpoint details recorded");
    assert!(endpoint.reused, "second exchange rides the pooled connection");
}

#[tokio::test]
async fn pool_serializes_over_max_total() {
    let server = server::http(move |_req| async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        http::Response::builder().body(server::empty()).unwrap()
    });

    let client = Client::builder()
        .pool_max_total(1)
        .pool_max_per_route(1)
        .build()
        .unwrap();
    let url = format!("http://{}/slow", server.addr());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            client.get(&url).send().await.unwrap().status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), courier::StatusCode::OK);
    }

    let stats = client.pool_stats();
    assert!(stats.leased + stats.available <= 1);
}

#[tokio::test]
async fn response_timeout_maps_to_timeout_error() {
    let server = server::http(move |_req| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        http::Response::builder().body(server::empty()).unwrap()
    });

    let err = Client::new()
        .get(format!("http://{}/slow", server.addr()))
        .timeout(Duration::from_millis(50))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn connect_timeout_has_its_own_kind() {
    // A non-routable address that blackholes the SYN.
    let err = Client::new()
        .get("http://10.255.255.1/")
        .connect_timeout(Duration::from_millis(50))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_connect_timeout());
    assert!(err.is_timeout());
}

#[tokio::test]
async fn http2_prior_knowledge_negotiates_h2() {
    let server = server::http(move |req| async move {
        assert_eq!(req.version(), http::Version::HTTP_2);
        http::Response::builder().body(server::empty()).unwrap()
    });

    let res = Client::builder()
        .http2_prior_knowledge(true)
        .build()
        .unwrap()
        .get(format!("http://{}/h2", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);
    assert_eq!(res.version(), http::Version::HTTP_2);
}

#[tokio::test]
async fn h2_concurrent_echoes_share_one_connection() {
    let server = server::http(move |mut req| async move {
        let mut full = Vec::new();
        while let Some(frame) = req.body_mut().frame().await {
            if let Ok(data) = frame.unwrap().into_data() {
                full.extend(&*data);
            }
        }
        http::Response::builder().body(server::body(full)).unwrap()
    });

    let client = Client::builder()
        .http2_prior_knowledge(true)
        .build()
        .unwrap();
    let url = format!("http://{}/echo", server.addr());

    // Warm one connection up so the streams share it.
    let warm = client.get(&url).send().await.unwrap();
    assert_eq!(warm.version(), http::Version::HTTP_2);

    let mut handles = Vec::new();
    for i in 0..16u32 {
        let client = client.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            let payload = format!("stream {i} payload").repeat(i as usize + 1);
            let res = client.post(&url).body(payload.clone()).send().await.unwrap();
            assert_eq!(res.status(), courier::StatusCode::OK);
            assert_eq!(res.text().await.unwrap(), payload);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let route = client.route_for(&url).unwrap();
    let stats = client.pool_stats_for(&route);
    assert_eq!(stats.available, 1, "h2 streams multiplex one connection");
}

#[tokio::test]
async fn error_for_status_carries_uri_and_status() {
    let server = server::http(move |_req| async move {
        http::Response::builder()
            .status(418)
            .body(server::empty())
            .unwrap()
    });

    let url = format!("http://{}/teapot", server.addr());
    let res = Client::new().get(&url).send().await.unwrap();
    let err = res.error_for_status().unwrap_err();
    assert!(err.is_status());
    assert_eq!(err.status(), Some(courier::StatusCode::IM_A_TEAPOT));
    assert_eq!(err.uri().unwrap().to_string(), url);
}

#[tokio::test]
async fn closed_client_fails_with_pool_shutdown() {
    let server = server::http(move |_req| async move {
        http::Response::builder().body(server::empty()).unwrap()
    });

    let client = Client::new();
    client.close();
    let err = client
        .get(format!("http://{}/late", server.addr()))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_pool_shutdown());
}

#[tokio::test]
async fn streaming_chunks_pull_incrementally() {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = {
        let hits = hits.clone();
        server::http(move |_req| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                http::Response::builder()
                    .body(server::body("streamed bytes"))
                    .unwrap()
            }
        })
    };

    let mut res = Client::new()
        .get(format!("http://{}/stream", server.addr()))
        .send()
        .await
        .unwrap();

    let mut collected = Vec::new();
    while let Some(chunk) = res.chunk().await.unwrap() {
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"streamed bytes");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
