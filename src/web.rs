use actix_web::{App, HttpResponse, HttpServer, Responder, get};
use serde::Serialize;

use crate::metrics::METRICS;

#[derive(Serialize)]
struct ProbeResp<'a> {
    status: &'a str,
}

#[get("/k8s/readyz")]
async fn readyz() -> impl Responder {
    if METRICS.is_ready() {
        HttpResponse::Ok().json(ProbeResp { status: "ok" })
    } else {
        HttpResponse::ServiceUnavailable().json(ProbeResp { status: "starting" })
    }
}

#[get("/k8s/livez")]
async fn livez() -> impl Responder {
    HttpResponse::Ok().json(ProbeResp { status: "ok" })
}

#[get("/k8s/metrics")]
async fn metrics() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(METRICS.snapshot().render())
}

pub async fn run_http(bind: String) -> std::io::Result<()> {
    let server = HttpServer::new(|| App::new().service(readyz).service(livez).service(metrics))
        .bind(bind)?
        .workers(1)
        .run();
    server.await
}
