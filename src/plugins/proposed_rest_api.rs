//! Serves a mock REST API for a host that does not exist yet.

use std::ops::ControlFlow;

use serde_json::{json, Value};

use crate::http::{build_http_response, Headers, HttpParser};
use crate::proxy::plugin::{ClientHandle, HttpProxyPlugin, PluginContext};

pub const API_SERVER: &str = "api.example.com";

/// Canned responses keyed by request path.
pub fn rest_api_routes() -> Value {
    json!({
        "/v1/users/": {
            "count": 2,
            "next": null,
            "previous": null,
            "results": [
                {
                    "email": "you@example.com",
                    "groups": [],
                    "url": format!("{}/v1/users/1/", API_SERVER),
                    "username": "admin",
                },
                {
                    "email": "someone@example.com",
                    "groups": [],
                    "url": format!("{}/v1/users/2/", API_SERVER),
                    "username": "someone",
                },
            ]
        },
    })
}

pub struct ProposedRestApi {
    client: ClientHandle,
    routes: Value,
}

pub fn factory(ctx: &PluginContext) -> Box<dyn HttpProxyPlugin> {
    Box::new(ProposedRestApi {
        client: ctx.client.clone(),
        routes: rest_api_routes(),
    })
}

fn is_api_request(request: &HttpParser) -> bool {
    request
        .upstream_address()
        .is_some_and(|(host, _)| host.eq_ignore_ascii_case(API_SERVER))
}

impl HttpProxyPlugin for ProposedRestApi {
    fn name(&self) -> &'static str {
        "proposed_rest_api"
    }

    fn before_upstream_connection(&mut self, request: &mut HttpParser) -> ControlFlow<()> {
        if is_api_request(request) {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn handle_client_request(&mut self, request: &mut HttpParser) -> ControlFlow<()> {
        if !is_api_request(request) {
            return ControlFlow::Continue(());
        }

        let path = request.path().unwrap_or("/");
        let packet = match self.routes.get(path) {
            Some(body) => {
                let headers: Headers = [("Content-Type", "application/json")].into_iter().collect();
                build_http_response(200, Some("OK"), &headers, Some(body.to_string().as_bytes()))
            }
            None => build_http_response(404, Some("Not Found"), &Headers::new(), None),
        };
        self.client.queue(packet);
        ControlFlow::Break(())
    }
}
