mod support;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use http_body_util::BodyExt;
use support::server;

use courier::{redirect::Policy, Client, Context};

#[tokio::test]
async fn post_downgrades_to_get_on_legacy_redirect_statuses() {
    let codes = [301u16, 302, 303];

    for &code in &codes {
        let redirect = server::http(move |req| async move {
            if req.method() == "POST" {
                assert_eq!(req.uri(), &*format!("/{code}"));
                http::Response::builder()
                    .status(code)
                    .header("location", "/dst")
                    .header("server", "test-redirect")
                    .body(server::empty())
                    .unwrap()
            } else {
                assert_eq!(req.method(), "GET");
                assert_eq!(req.uri(), "/dst");

                // The downgrade drops the original body along with the
                // method.
                let data = req.into_body().collect().await.unwrap().to_bytes();
                assert!(data.is_empty());

                http::Response::builder()
                    .header("server", "test-dst")
                    .body(server::empty())
                    .unwrap()
            }
        });

        let url = format!("http://{}/{}", redirect.addr(), code);
        let dst = format!("http://{}/{}", redirect.addr(), "dst");
        let client = Client::new();
        let res = client
            .post(&url)
            .body("downgraded away")
            .send()
            .await
            .unwrap();
        assert_eq!(res.uri(), &dst.parse::<http::Uri>().unwrap());
        assert_eq!(res.status(), courier::StatusCode::OK);
        assert_eq!(
            res.headers().get(courier::header::SERVER).unwrap(),
            &"test-dst"
        );
    }
}

#[tokio::test]
async fn post_body_replays_on_307_and_308() {
    let codes = [307u16, 308];
    for &code in &codes {
        let redirect = server::http(move |mut req| async move {
            assert_eq!(req.method(), "POST");
            assert_eq!(req.headers()["content-length"], "5");

            let data = req
                .body_mut()
                .frame()
                .await
                .unwrap()
                .unwrap()
                .into_data()
                .unwrap();
            assert_eq!(&*data, b"Hello");

            if req.uri() == &*format!("/{code}") {
                http::Response::builder()
                    .status(code)
                    .header("location", "/dst")
                    .header("server", "test-redirect")
                    .body(server::empty())
                    .unwrap()
            } else {
                assert_eq!(req.uri(), "/dst");

                http::Response::builder()
                    .header("server", "test-dst")
                    .body(server::empty())
                    .unwrap()
            }
        });

        let url = format!("http://{}/{}", redirect.addr(), code);
        let client = Client::new();
        let res = client.post(&url).body("Hello").send().await.unwrap();
        assert_eq!(res.status(), courier::StatusCode::OK);
        assert_eq!(
            res.headers().get(courier::header::SERVER).unwrap(),
            &"test-dst"
        );
    }
}

#[tokio::test]
async fn streaming_body_fails_307_as_non_repeatable() {
    let server = server::http(move |mut req| async move {
        assert_eq!(req.method(), "POST");
        let mut full: Vec<u8> = Vec::new();
        while let Some(frame) = req.body_mut().frame().await {
            if let Ok(data) = frame.unwrap().into_data() {
                full.extend(&*data);
            }
        }
        assert_eq!(full, b"from a stream");
        http::Response::builder()
            .status(307)
            .header("location", "/dst")
            .body(server::empty())
            .unwrap()
    });

    let url = format!("http://{}/307", server.addr());
    let client = Client::new();
    let err = client
        .post(&url)
        .body(courier::Body::wrap(courier::Body::from("from a stream")))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_non_repeatable());
}

#[tokio::test]
async fn cross_origin_hop_drops_caller_credentials() {
    let end_hits = Arc::new(AtomicUsize::new(0));

    let end_server = {
        let end_hits = end_hits.clone();
        server::http(move |req| {
            let end_hits = end_hits.clone();
            async move {
                end_hits.fetch_add(1, Ordering::SeqCst);
                assert!(req.headers().get("authorization").is_none());
                assert!(req.headers().get("cookie").is_none());
                http::Response::builder().body(server::empty()).unwrap()
            }
        })
    };

    let end_addr = end_server.addr();
    // The loopback IP differs in host:port, which is what cross-origin
    // means to the scrubber.
    let mid_server = server::http(move |req| async move {
        assert!(req.headers().get("authorization").is_some());
        http::Response::builder()
            .status(302)
            .header("location", format!("http://{end_addr}/end"))
            .body(server::empty())
            .unwrap()
    });

    let client = Client::new();
    let res = client
        .get(format!("http://{}/mid", mid_server.addr()))
        .header("authorization", "Basic caller-added")
        .header("cookie", "session=1")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);
    assert_eq!(end_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn same_origin_hop_keeps_caller_credentials() {
    let server = server::http(move |req| async move {
        match req.uri().path() {
            "/first" => http::Response::builder()
                .status(302)
                .header("location", "/second")
                .body(server::empty())
                .unwrap(),
            "/second" => {
                assert_eq!(req.headers()["authorization"], "Basic same-origin");
                http::Response::builder().body(server::empty()).unwrap()
            }
            other => panic!("unexpected path {other:?}"),
        }
    });

    let client = Client::new();
    let res = client
        .get(format!("http://{}/first", server.addr()))
        .header("authorization", "Basic same-origin")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);
}

#[tokio::test]
async fn revisiting_a_location_is_a_circular_redirect() {
    let server = server::http(move |req| async move {
        assert_eq!(req.uri(), "/loop");
        http::Response::builder()
            .status(302)
            .header("location", "/loop")
            .body(server::empty())
            .unwrap()
    });

    let url = format!("http://{}/loop", server.addr());
    let err = Client::new().get(&url).send().await.unwrap_err();
    // Revisiting the same (method, URI) is refused before any hop cap.
    assert!(err.is_circular_redirect());
}

#[tokio::test]
async fn circular_allowed_exhausts_the_hop_cap() {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = {
        let hits = hits.clone();
        server::http(move |req| {
            let hits = hits.clone();
            async move {
                assert_eq!(req.uri(), "/loop");
                hits.fetch_add(1, Ordering::SeqCst);
                http::Response::builder()
                    .status(302)
                    .header("location", "/loop")
                    .body(server::empty())
                    .unwrap()
            }
        })
    };

    let url = format!("http://{}/loop", server.addr());
    let err = Client::new()
        .get(&url)
        .circular_redirects(true)
        .max_redirects(5)
        .send()
        .await
        .unwrap_err();
    assert!(err.is_too_many_redirects());
    // N redirects followed means exactly N+1 exchanges hit the wire.
    assert_eq!(hits.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn policy_none_returns_the_302_untouched() {
    let server = server::http(move |req| async move {
        assert_eq!(req.uri(), "/no-redirect");
        http::Response::builder()
            .status(302)
            .header("location", "/dont")
            .header("server", "test-dont-redirect")
            .body(server::empty())
            .unwrap()
    });

    let url = format!("http://{}/no-redirect", server.addr());
    let res = Client::builder()
        .redirect(Policy::none())
        .build()
        .unwrap()
        .get(&url)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::FOUND);
    assert_eq!(
        res.headers().get(courier::header::SERVER).unwrap(),
        &"test-dont-redirect"
    );
}

#[tokio::test]
async fn no_referer_header_by_default() {
    let server = server::http(move |req| async move {
        if req.uri() == "/no-refer" {
            http::Response::builder()
                .status(302)
                .header("location", "/dst")
                .body(server::empty())
                .unwrap()
        } else {
            assert_eq!(req.uri(), "/dst");
            assert_eq!(req.headers().get("referer"), None);
            http::Response::builder().body(server::empty()).unwrap()
        }
    });
    Client::new()
        .get(format!("http://{}/no-refer", server.addr()))
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn referer_tracks_previous_hop_when_enabled() {
    let server = server::http(move |req| async move {
        if req.uri() == "/from" {
            http::Response::builder()
                .status(302)
                .header("location", "/dst")
                .body(server::empty())
                .unwrap()
        } else {
            assert_eq!(req.uri(), "/dst");
            assert!(req
                .headers()
                .get("referer")
                .expect("referer header")
                .to_str()
                .unwrap()
                .ends_with("/from"));
            http::Response::builder().body(server::empty()).unwrap()
        }
    });
    Client::builder()
        .referer(true)
        .build()
        .unwrap()
        .get(format!("http://{}/from", server.addr()))
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn response_uri_reflects_final_location() {
    let server = server::http(move |req| async move {
        if req.uri().path() == "/oldlocation/123" {
            http::Response::builder()
                .status(301)
                .header("location", "/random/123")
                .body(server::empty())
                .unwrap()
        } else {
            assert_eq!(req.uri().path(), "/random/123");
            http::Response::builder().body(server::body("ok")).unwrap()
        }
    });

    let res = Client::new()
        .get(format!("http://{}/oldlocation/123", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);
    assert_eq!(res.uri().path(), "/random/123");
}

#[tokio::test]
async fn relative_location_resolves_against_request_path() {
    let server = server::http(move |req| async move {
        if req.uri().path() == "/random/oldlocation" {
            http::Response::builder()
                .status(302)
                // a bare relative reference, resolved per RFC 3986
                .header("location", "100")
                .body(server::empty())
                .unwrap()
        } else {
            assert_eq!(req.uri().path(), "/random/100");
            http::Response::builder().body(server::empty()).unwrap()
        }
    });

    let res = Client::new()
        .get(format!("http://{}/random/oldlocation", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.uri().path(), "/random/100");
}

#[tokio::test]
async fn whitespace_in_location_is_a_protocol_error() {
    let server = server::http(move |_req| async move {
        http::Response::builder()
            .status(302)
            .header("location", "/with whitespace")
            .body(server::empty())
            .unwrap()
    });

    let err = Client::new()
        .get(format!("http://{}/start", server.addr()))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_protocol());
}

#[tokio::test]
async fn status_300_and_304_pass_through() {
    for code in [300u16, 304] {
        let server = server::http(move |_req| async move {
            http::Response::builder()
                .status(code)
                .header("location", "/elsewhere")
                .body(server::empty())
                .unwrap()
        });

        let res = Client::new()
            .get(format!("http://{}/multiple", server.addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), code);
    }
}

#[tokio::test]
async fn context_records_the_redirect_trail() {
    let server = server::http(move |req| async move {
        match req.uri().path() {
            "/a" => http::Response::builder()
                .status(301)
                .header("location", "/b")
                .body(server::empty())
                .unwrap(),
            "/b" => http::Response::builder()
                .status(302)
                .header("location", "/c")
                .body(server::empty())
                .unwrap(),
            "/c" => http::Response::builder().body(server::empty()).unwrap(),
            other => panic!("unexpected path {other:?}"),
        }
    });

    let ctx = Context::new();
    let res = Client::new()
        .get(format!("http://{}/a", server.addr()))
        .context(ctx.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);

    let trail = ctx.redirect_trail();
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[0].status.as_u16(), 301);
    assert_eq!(trail[0].from.path(), "/a");
    assert_eq!(trail[0].to.path(), "/b");
    assert_eq!(trail[1].status.as_u16(), 302);
    assert_eq!(trail[1].to.path(), "/c");
}

#[tokio::test]
async fn per_request_override_disables_following() {
    let server = server::http(move |_req| async move {
        http::Response::builder()
            .status(302)
            .header("location", "/elsewhere")
            .body(server::empty())
            .unwrap()
    });

    let res = Client::new()
        .get(format!("http://{}/fixed", server.addr()))
        .redirects(false)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::FOUND);
}
