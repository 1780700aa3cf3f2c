use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use proptest::prelude::*;
use spark_channel::{
    Channel, ChannelConfig, ChannelError, ChannelHandler, ChannelHandlerContext,
    ChannelOutboundBuffer, ConnectStatus, EventLoop, EventLoopConfig, LocalAddress,
    PipelineMessage, Result, SocketAddress, Transport,
};
use spark_codec_frame::{
    ByteToMessageDecoder, ExpandCumulator, LengthFieldBasedFrameDecoder, LengthFieldConfig,
    LengthFieldPrepender, MessageToByteEncoder,
};

const WAIT: Duration = Duration::from_secs(5);
const ROUNDTRIP_MAX: usize = 256;

/// 连接即激活的内存传输，写出的字节收集到 `wire`。
struct WireTransport {
    open: AtomicBool,
    active: AtomicBool,
    wire: Arc<Mutex<Vec<Bytes>>>,
}

impl Transport for WireTransport {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_active(&self) -> bool {
        self.is_open() && self.active.load(Ordering::SeqCst)
    }

    fn local_address(&self) -> Option<SocketAddress> {
        None
    }

    fn remote_address(&self) -> Option<SocketAddress> {
        None
    }

    fn do_bind(&self, _channel: &Channel, _local: &SocketAddress) -> Result<()> {
        Ok(())
    }

    fn do_connect(
        &self,
        _channel: &Channel,
        _remote: &SocketAddress,
        _local: Option<&SocketAddress>,
    ) -> Result<ConnectStatus> {
        self.active.store(true, Ordering::SeqCst);
        Ok(ConnectStatus::Connected)
    }

    fn do_disconnect(&self, _channel: &Channel) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn do_close(&self, _channel: &Channel) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn do_begin_read(&self, _channel: &Channel) -> Result<()> {
        Ok(())
    }

    fn do_write(&self, _channel: &Channel, buffer: &Arc<ChannelOutboundBuffer>) -> Result<()> {
        while let Some(message) = buffer.take_current() {
            if let Ok(bytes) = message.into_bytes() {
                self.wire.lock().push(bytes);
            }
            buffer.remove();
        }
        Ok(())
    }
}

#[derive(Default)]
struct Collected {
    frames: Vec<Vec<u8>>,
    errors: Vec<String>,
    read_completes: usize,
    inactive: bool,
}

/// 流水线末端的收集器。
struct Collector {
    collected: Arc<Mutex<Collected>>,
}

impl ChannelHandler for Collector {
    fn channel_read(&self, _ctx: &ChannelHandlerContext, message: PipelineMessage) -> Result<()> {
        if let Some(bytes) = message.as_bytes() {
            self.collected.lock().frames.push(bytes.to_vec());
        }
        Ok(())
    }

    fn channel_read_complete(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        self.collected.lock().read_completes += 1;
        Ok(())
    }

    fn channel_inactive(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        self.collected.lock().inactive = true;
        Ok(())
    }

    fn exception_caught(&self, _ctx: &ChannelHandlerContext, cause: ChannelError) -> Result<()> {
        self.collected.lock().errors.push(cause.to_string());
        Ok(())
    }
}

struct Harness {
    event_loop: EventLoop,
    channel: Channel,
    wire: Arc<Mutex<Vec<Bytes>>>,
    collected: Arc<Mutex<Collected>>,
}

impl Harness {
    fn new(name: &str, decoder: Arc<dyn ChannelHandler>) -> Self {
        let event_loop = EventLoop::new(EventLoopConfig::new(name)).expect("spawn event loop");
        let wire = Arc::new(Mutex::new(Vec::new()));
        let channel = Channel::new(
            WireTransport {
                open: AtomicBool::new(true),
                active: AtomicBool::new(false),
                wire: Arc::clone(&wire),
            },
            None,
            ChannelConfig::default(),
        );
        let collected = Arc::new(Mutex::new(Collected::default()));
        channel
            .pipeline()
            .add_last(
                "prepender",
                Arc::new(MessageToByteEncoder::new(
                    LengthFieldPrepender::new(4).expect("valid width"),
                )),
            )
            .and_then(|pipeline| pipeline.add_last("decoder", decoder))
            .and_then(|pipeline| {
                pipeline.add_last(
                    "collector",
                    Arc::new(Collector {
                        collected: Arc::clone(&collected),
                    }),
                )
            })
            .expect("install handlers");
        event_loop
            .register(&channel)
            .wait_timeout(WAIT)
            .expect("registration completes")
            .expect("registration");
        channel
            .connect(LocalAddress::new("peer"))
            .wait_timeout(WAIT)
            .expect("connect completes")
            .expect("connect");
        Self {
            event_loop,
            channel,
            wire,
            collected,
        }
    }

    fn length_field(name: &str, max_frame_length: usize) -> Self {
        let decoder = LengthFieldBasedFrameDecoder::new(max_frame_length, 0, 4).expect("valid config");
        Self::new(name, Arc::new(ByteToMessageDecoder::new(decoder)))
    }

    /// 从 head 注入入站字节块，并等待循环处理完毕。
    fn feed(&self, chunks: Vec<Bytes>) {
        let channel = self.channel.clone();
        self.event_loop
            .submit(move || {
                for chunk in chunks {
                    channel.pipeline().fire_channel_read(chunk.into());
                }
                channel.pipeline().fire_channel_read_complete();
            })
            .wait_timeout(WAIT)
            .expect("feed completes")
            .expect("feed");
    }

    fn settle(&self) {
        for _ in 0..3 {
            self.event_loop
                .submit(|| ())
                .wait_timeout(WAIT)
                .expect("barrier completes")
                .expect("barrier");
        }
    }

    fn shutdown(self) {
        let _ = self
            .event_loop
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(1))
            .wait_timeout(WAIT);
    }
}

fn le_header(length: u32) -> Bytes {
    Bytes::copy_from_slice(&length.to_le_bytes())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prepended_frames_decode_back_to_the_payloads(
        payloads in prop::collection::vec(
            prop::collection::vec(any::<u8>(), 0..=ROUNDTRIP_MAX),
            1..6,
        ),
        chunk in 1usize..64,
    ) {
        let harness = Harness::length_field("frame-roundtrip", ROUNDTRIP_MAX);
        for payload in &payloads {
            let written = harness
                .channel
                .write_and_flush(Bytes::from(payload.clone()))
                .wait_timeout(WAIT)
                .expect("write completes");
            prop_assert!(written.is_ok());
        }
        let wire: Vec<u8> = harness.wire.lock().iter().flat_map(|bytes| bytes.to_vec()).collect();
        prop_assert_eq!(wire.len(), payloads.iter().map(|p| p.len() + 4).sum::<usize>());

        let chunks: Vec<Bytes> = wire.chunks(chunk).map(Bytes::copy_from_slice).collect();
        harness.feed(chunks);
        let frames = harness.collected.lock().frames.clone();
        prop_assert_eq!(frames, payloads);
        prop_assert!(harness.collected.lock().errors.is_empty());
        harness.shutdown();
    }
}

#[test]
fn a_too_long_header_fails_fast_and_later_frames_still_decode() {
    let harness = Harness::length_field("frame-fail-fast", 20);
    harness.feed(vec![le_header(1000), Bytes::from_static(&[0xEE; 10])]);
    {
        let collected = harness.collected.lock();
        assert!(collected.frames.is_empty());
        assert_eq!(
            collected.errors,
            vec!["too long frame: Adjusted frame length exceeds 20: 1004 - discarding".to_owned()]
        );
    }

    let mut tail = vec![0xEE_u8; 990];
    tail.extend_from_slice(&le_header(3));
    tail.extend_from_slice(b"fin");
    harness.feed(vec![Bytes::from(tail)]);
    let collected = harness.collected.lock();
    assert_eq!(collected.frames, vec![b"fin".to_vec()]);
    assert_eq!(collected.errors.len(), 1);
    drop(collected);
    harness.shutdown();
}

#[test]
fn payloads_at_the_limit_survive_the_pipeline() {
    let harness = Harness::length_field("frame-limit", 20);
    let payloads: Vec<Vec<u8>> = (16..=20).map(|length| vec![length as u8; length]).collect();
    for payload in &payloads {
        harness
            .channel
            .write_and_flush(Bytes::from(payload.clone()))
            .wait_timeout(WAIT)
            .expect("write completes")
            .expect("write");
    }
    let wire: Vec<Bytes> = harness.wire.lock().clone();
    harness.feed(wire);
    let collected = harness.collected.lock();
    assert_eq!(collected.frames, payloads);
    assert!(collected.errors.is_empty());
    drop(collected);
    harness.shutdown();
}

#[test]
fn a_too_long_header_split_across_reads_fails_once_it_is_complete() {
    let harness = Harness::length_field("frame-split-fail-fast", 20);
    let header = le_header(1000);
    harness.feed(vec![header.slice(..2)]);
    assert!(harness.collected.lock().errors.is_empty());

    let mut second = header.slice(2..).to_vec();
    second.extend_from_slice(&[0xEE; 6]);
    harness.feed(vec![Bytes::from(second)]);
    assert_eq!(
        harness.collected.lock().errors,
        vec!["too long frame: Adjusted frame length exceeds 20: 1004 - discarding".to_owned()]
    );

    harness.feed(vec![Bytes::from(vec![0xEE_u8; 500])]);
    let mut last = vec![0xEE_u8; 494];
    last.extend_from_slice(&le_header(2));
    last.extend_from_slice(b"ok");
    harness.feed(vec![Bytes::from(last)]);
    let collected = harness.collected.lock();
    assert_eq!(collected.frames, vec![b"ok".to_vec()]);
    assert_eq!(collected.errors.len(), 1, "the discard tail is silent");
    drop(collected);
    harness.shutdown();
}

#[test]
fn lazy_discard_across_reads_reports_after_the_last_byte() {
    let config = LengthFieldConfig {
        max_frame_length: 16,
        fail_fast: false,
        ..LengthFieldConfig::default()
    };
    let decoder = LengthFieldBasedFrameDecoder::with_config(config).expect("valid config");
    let harness = Harness::new("frame-split-lazy", Arc::new(ByteToMessageDecoder::new(decoder)));

    let mut first = le_header(30).to_vec();
    first.extend_from_slice(&[0xEE; 6]);
    harness.feed(vec![Bytes::from(first)]);
    harness.feed(vec![Bytes::from(vec![0xEE_u8; 12])]);
    assert!(harness.collected.lock().errors.is_empty(), "still discarding");

    harness.feed(vec![Bytes::from(vec![0xEE_u8; 12])]);
    assert_eq!(
        harness.collected.lock().errors,
        vec!["too long frame: Adjusted frame length exceeds 16: 34 - discarded".to_owned()]
    );

    let mut next = le_header(3).to_vec();
    next.extend_from_slice(b"fin");
    harness.feed(vec![Bytes::from(next)]);
    let collected = harness.collected.lock();
    assert_eq!(collected.frames, vec![b"fin".to_vec()]);
    assert_eq!(collected.errors.len(), 1);
    drop(collected);
    harness.shutdown();
}

#[test]
fn removing_the_decoder_forwards_the_undecoded_bytes() {
    let harness = Harness::length_field("frame-removal", 64);
    harness.feed(vec![le_header(5), Bytes::from_static(b"he")]);
    assert!(harness.collected.lock().frames.is_empty());

    harness.channel.pipeline().remove("decoder").expect("remove decoder");
    harness.settle();
    let mut expected = le_header(5).to_vec();
    expected.extend_from_slice(b"he");
    assert_eq!(harness.collected.lock().frames, vec![expected]);
    harness.shutdown();
}

#[test]
fn closing_the_channel_runs_the_last_decode_before_inactive() {
    let decoder = ByteToMessageDecoder::new(
        LengthFieldBasedFrameDecoder::new(64, 0, 4).expect("valid config"),
    )
    .with_cumulator(Arc::new(ExpandCumulator));
    let harness = Harness::new("frame-inactive", Arc::new(decoder));
    harness.feed(vec![le_header(2), Bytes::from_static(b"o")]);
    harness.channel.close().wait_timeout(WAIT).expect("close completes").expect("close");
    harness.settle();
    let collected = harness.collected.lock();
    assert!(collected.inactive);
    assert!(collected.frames.is_empty(), "an incomplete frame is dropped on close");
    assert!(collected.errors.is_empty());
    drop(collected);
    harness.shutdown();
}

#[test]
fn single_decode_stops_after_one_frame_per_read() {
    let decoder = ByteToMessageDecoder::new(
        LengthFieldBasedFrameDecoder::new(64, 0, 4).expect("valid config"),
    )
    .with_single_decode(true);
    let harness = Harness::new("frame-single", Arc::new(decoder));
    let mut two = le_header(1).to_vec();
    two.push(b'a');
    two.extend_from_slice(&le_header(1));
    two.push(b'b');
    harness.feed(vec![Bytes::from(two)]);
    assert_eq!(harness.collected.lock().frames, vec![b"a".to_vec()]);

    harness.feed(vec![Bytes::new()]);
    assert_eq!(harness.collected.lock().frames, vec![b"a".to_vec(), b"b".to_vec()]);
    harness.shutdown();
}

#[test]
fn non_byte_messages_pass_through_both_directions() {
    let harness = Harness::length_field("frame-passthrough", 64);
    let channel = harness.channel.clone();
    harness
        .event_loop
        .submit(move || channel.pipeline().fire_channel_read(PipelineMessage::user(42_u32)))
        .wait_timeout(WAIT)
        .expect("submit completes")
        .expect("submit");
    assert!(harness.collected.lock().frames.is_empty());
    assert!(harness.collected.lock().errors.is_empty());

    let written = harness
        .channel
        .write_and_flush(PipelineMessage::user("not bytes"))
        .wait_timeout(WAIT)
        .expect("write completes");
    assert!(written.is_ok());
    assert!(harness.wire.lock().is_empty(), "the wire only keeps byte messages");
    harness.shutdown();
}
