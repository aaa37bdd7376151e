use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

use mediawire_runtime::loopback::LoopbackTransport;
use mediawire_runtime::{ChannelKind, ContextConfig, OutgoingFrame, TransportContext};
use mediawire_transport::media::FrameKind;

fn context(link: &Arc<LoopbackTransport>, probe: bool) -> TransportContext {
    let mut builder = TransportContext::builder(ContextConfig::default())
        .transport(ChannelKind::Control, link.clone())
        .transport(ChannelKind::Video, link.clone());
    if probe {
        builder = builder.occupancy_probe(link.clone());
    }
    let ctx = builder.build().unwrap();
    ctx.start(ChannelKind::Control, 0).unwrap();
    ctx.start(ChannelKind::Video, 0).unwrap();
    ctx
}

/// Send-side dispatch: control unit packing and video fragment+pack, with
/// and without the drop gate consulted.
fn bench_send(c: &mut Criterion) {
    let mut group = c.benchmark_group("send");
    group.throughput(Throughput::Elements(1));

    let link = Arc::new(LoopbackTransport::new(1 << 16));
    let ctx = context(&link, false);
    let control = OutgoingFrame::raw(vec![0x11u8; 256]);
    group.bench_function("control_256", |b| {
        b.iter(|| {
            black_box(ctx.send(ChannelKind::Control, control.clone()).unwrap());
            link.pop();
        });
    });

    let mut frame = vec![0x00, 0x00, 0x00, 0x01, 0x41];
    frame.resize(30_000, 0xAB);
    let video = OutgoingFrame::video(frame, FrameKind::Unknown);
    group.bench_function("video_30k", |b| {
        b.iter(|| {
            black_box(ctx.send(ChannelKind::Video, video.clone()).unwrap());
            while link.pop().is_some() {}
        });
    });

    let gated_link = Arc::new(LoopbackTransport::new(1 << 16));
    let gated = context(&gated_link, true);
    group.bench_function("video_30k_drop_gate", |b| {
        b.iter(|| {
            black_box(gated.send(ChannelKind::Video, video.clone()).unwrap());
            while gated_link.pop().is_some() {}
        });
    });

    group.finish();
}

/// Receive-side dispatch of a packed control unit to the callback.
fn bench_receive(c: &mut Criterion) {
    let mut group = c.benchmark_group("receive");
    group.throughput(Throughput::Elements(1));

    let link = Arc::new(LoopbackTransport::new(16));
    let ctx = context(&link, false);
    ctx.register_receive_callback(ChannelKind::Control, |_, data| {
        black_box(data);
    });
    ctx.send(ChannelKind::Control, OutgoingFrame::raw(vec![0x22u8; 256]))
        .unwrap();
    let unit = link.pop().unwrap();

    group.bench_function("control_256", |b| {
        b.iter(|| ctx.receive(ChannelKind::Control, black_box(&unit)).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_send, bench_receive);
criterion_main!(benches);
