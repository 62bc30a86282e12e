// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Codec micro-benchmarks.
//!
//! Measures the two hot serialization paths: the XMLRPC envelope used on
//! every control-plane call, and the TCPROS length-prefix framing used on
//! every data-plane message.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use rros::tcpros::{encode_frame_into, FrameReader, TcprosHeader};
use rros::xmlrpc::{self, Value};

fn register_params() -> Vec<Value> {
    vec![
        Value::string("/bench_node"),
        Value::string("/chatter"),
        Value::string("std_msgs/String"),
        Value::string("http://127.0.0.1:41234/"),
    ]
}

fn bench_xmlrpc_encode(c: &mut Criterion) {
    let params = register_params();
    c.bench_function("xmlrpc_encode_request", |b| {
        b.iter(|| {
            black_box(xmlrpc::encode_request(
                "registerSubscriber",
                black_box(&params),
                "127.0.0.1",
                11311,
            ))
        });
    });
}

fn bench_xmlrpc_decode(c: &mut Criterion) {
    let wire = xmlrpc::encode_response(&[Value::Array(vec![
        Value::Int(1),
        Value::string("ok"),
        Value::Array(vec![
            Value::string("http://10.0.0.1:40001/"),
            Value::string("http://10.0.0.2:40002/"),
        ]),
    ])]);
    let msg = xmlrpc::try_split_http(&wire).unwrap().unwrap();
    let body = String::from_utf8(msg.body).unwrap();

    c.bench_function("xmlrpc_decode_response", |b| {
        b.iter(|| black_box(xmlrpc::decode_response(black_box(&body)).unwrap()));
    });
}

fn bench_frame_round_trip(c: &mut Criterion) {
    let payload = vec![0x5Au8; 1024];

    c.bench_function("tcpros_frame_encode_1k", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(payload.len() + 4);
            encode_frame_into(black_box(&payload), &mut out);
            black_box(out)
        });
    });

    let mut wire = Vec::new();
    for _ in 0..16 {
        encode_frame_into(&payload, &mut wire);
    }
    c.bench_function("tcpros_frame_decode_16x1k", |b| {
        b.iter(|| {
            let mut reader = FrameReader::new(1024 * 1024);
            reader.feed(black_box(&wire));
            let mut frames = 0;
            while reader.next_frame().unwrap().is_some() {
                frames += 1;
            }
            black_box(frames)
        });
    });
}

fn bench_header_round_trip(c: &mut Criterion) {
    let header = TcprosHeader::new()
        .with("callerid", "/bench_node")
        .with("topic", "/chatter")
        .with("type", "std_msgs/String")
        .with("md5sum", "992ce8a1687cec8c8bd883ec73ca41d1")
        .with("message_definition", "string data\n");

    c.bench_function("tcpros_header_encode", |b| {
        b.iter(|| black_box(header.encode()));
    });

    let block = header.encode();
    let mut reader = FrameReader::new(4096);
    reader.feed(&block);
    let payload = reader.next_frame().unwrap().unwrap();
    c.bench_function("tcpros_header_parse", |b| {
        b.iter(|| black_box(TcprosHeader::parse(black_box(&payload)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_xmlrpc_encode,
    bench_xmlrpc_decode,
    bench_frame_round_trip,
    bench_header_round_trip
);
criterion_main!(benches);
