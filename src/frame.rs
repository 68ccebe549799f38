use std::mem;

use anyhow::Result;
use log::trace;

use crate::buffer::ByteBuffer;

// Command tags, two opaque bytes on the wire. Values mirror the constants
// table compiled into the Android peer; the codec only compares them for
// equality.
pub const CMD_CONNECT_SOCKET: [u8; 2] = [0x00, 0x01];
pub const CMD_DISCONNECT_SOCKET: [u8; 2] = [0x00, 0x02];
pub const CMD_DATA_PACKET: [u8; 2] = [0x00, 0x03];
pub const CMD_CONNECTION_RESP: [u8; 2] = [0x00, 0x04];
pub const CMD_ACCESSORY_CONNECTED: [u8; 2] = [0x00, 0x05];
pub const CMD_CLOSE_ACCESSORY: [u8; 2] = [0x00, 0x06];

/// Receives every complete frame the decoder reassembles, in arrival order.
pub trait FrameHandler {
    fn on_frame(&mut self, command: [u8; 2], payload: &[u8]);
}

/// Outbound side of the link. `send_frame` must transmit the frame as a
/// single bulk-OUT transfer and serialize concurrent callers so frames
/// never interleave on the wire.
pub trait CommandSink: Send + Sync {
    fn send_frame(&self, frame: &[u8]) -> Result<()>;

    fn send(&self, command: [u8; 2], payload: &[u8]) -> Result<()> {
        self.send_frame(&encode_frame(command, payload))
    }

    fn send_empty(&self, command: [u8; 2]) -> Result<()> {
        self.send(command, &[])
    }

    fn send_u16(&self, command: [u8; 2], value: u16) -> Result<()> {
        self.send(command, &value.to_be_bytes())
    }
}

/// `command(2) || payload_size(2, big-endian) || payload`.
pub fn encode_frame(command: [u8; 2], payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= u16::MAX as usize, "payload too large for frame");
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&command);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

const HEADER_LEN: usize = 4;

enum DecodeState {
    /// Ready to consume a header.
    Idle,
    /// A header straddled the previous chunk; the accumulator holds 1..3
    /// bytes of it.
    SplitHeader(ByteBuffer),
    /// Header parsed, payload incomplete. The accumulator is sized to the
    /// full payload; its remaining space is what is still owed.
    SplitPayload { command: [u8; 2], acc: ByteBuffer },
}

/// Stateful reassembly of frames from arbitrarily sized bulk-IN chunks.
/// Headers and payloads may straddle any number of chunks in either
/// direction; every byte fed in is either dispatched as part of a frame or
/// retained in the split state. `feed` never blocks.
pub struct FrameDecoder {
    state: DecodeState,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { state: DecodeState::Idle }
    }

    pub fn feed(&mut self, chunk: &[u8], handler: &mut dyn FrameHandler) {
        trace!("decoding bulk chunk of {} bytes", chunk.len());
        let mut data = ByteBuffer::wrap(chunk);
        loop {
            match mem::replace(&mut self.state, DecodeState::Idle) {
                DecodeState::SplitPayload { command, mut acc } => {
                    acc.fill(&mut data);
                    if acc.has_remaining() {
                        // Chunk exhausted before the payload completed.
                        self.state = DecodeState::SplitPayload { command, acc };
                        return;
                    }
                    trace!("split payload completed");
                    acc.flip();
                    handler.on_frame(command, acc.remaining_slice());
                }
                DecodeState::SplitHeader(mut acc) => {
                    acc.fill(&mut data);
                    if acc.has_remaining() {
                        self.state = DecodeState::SplitHeader(acc);
                        return;
                    }
                    trace!("split header completed");
                    acc.flip();
                    let command = {
                        let b = acc.get_bytes(2);
                        [b[0], b[1]]
                    };
                    let payload_size = acc.get_u16() as usize;
                    self.begin_payload(command, payload_size, &mut data, handler);
                }
                DecodeState::Idle => {
                    if data.remaining() >= HEADER_LEN {
                        let command = {
                            let b = data.get_bytes(2);
                            [b[0], b[1]]
                        };
                        let payload_size = data.get_u16() as usize;
                        self.begin_payload(command, payload_size, &mut data, handler);
                    } else if data.has_remaining() {
                        // 1..3 residual bytes: the start of the next header.
                        let mut acc = ByteBuffer::new(HEADER_LEN);
                        acc.fill(&mut data);
                        self.state = DecodeState::SplitHeader(acc);
                        return;
                    } else {
                        return;
                    }
                }
            }
        }
    }

    fn begin_payload(
        &mut self,
        command: [u8; 2],
        payload_size: usize,
        data: &mut ByteBuffer,
        handler: &mut dyn FrameHandler,
    ) {
        if payload_size == 0 {
            handler.on_frame(command, &[]);
        } else if payload_size <= data.remaining() {
            // Entire payload is in this chunk.
            handler.on_frame(command, data.get_bytes(payload_size));
        } else {
            let mut acc = ByteBuffer::new(payload_size);
            acc.fill(data);
            self.state = DecodeState::SplitPayload { command, acc };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        frames: Vec<([u8; 2], Vec<u8>)>,
    }

    impl FrameHandler for Recorder {
        fn on_frame(&mut self, command: [u8; 2], payload: &[u8]) {
            self.frames.push((command, payload.to_vec()));
        }
    }

    fn decode_chunked(stream: &[u8], chunk_len: usize) -> Vec<([u8; 2], Vec<u8>)> {
        let mut decoder = FrameDecoder::new();
        let mut recorder = Recorder::default();
        for chunk in stream.chunks(chunk_len) {
            decoder.feed(chunk, &mut recorder);
        }
        recorder.frames
    }

    #[test]
    fn round_trip_preserves_command_and_payload() {
        for len in [0usize, 1, 2, 3, 5, 128, 8186, 65535] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = encode_frame(CMD_DATA_PACKET, &payload);
            assert_eq!(frame.len(), 4 + len);

            let frames = decode_chunked(&frame, frame.len());
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].0, CMD_DATA_PACKET);
            assert_eq!(frames[0].1, payload);
        }
    }

    #[test]
    fn chunking_is_invisible() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(CMD_CLOSE_ACCESSORY, &[]));
        stream.extend_from_slice(&encode_frame(
            CMD_DATA_PACKET,
            &[0x00, 0x07, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04],
        ));
        stream.extend_from_slice(&encode_frame(CMD_CONNECTION_RESP, &[0x00, 0x07, 0x00, 0x01]));

        let reference = decode_chunked(&stream, stream.len());
        assert_eq!(reference.len(), 3);
        for chunk_len in [1, 2, 3, 4, 5, 7, 9, 11, 16] {
            assert_eq!(
                decode_chunked(&stream, chunk_len),
                reference,
                "chunk_len {} changed the dispatch sequence",
                chunk_len
            );
        }
    }

    #[test]
    fn header_split_across_two_chunks() {
        let mut decoder = FrameDecoder::new();
        let mut recorder = Recorder::default();
        decoder.feed(&CMD_CLOSE_ACCESSORY, &mut recorder);
        assert!(recorder.frames.is_empty());
        decoder.feed(&[0x00, 0x00], &mut recorder);
        assert_eq!(recorder.frames, vec![(CMD_CLOSE_ACCESSORY, vec![])]);
    }

    #[test]
    fn payload_split_across_three_chunks() {
        // 10-byte payload: session id 5, then 8 data bytes.
        let mut first = Vec::from(CMD_DATA_PACKET);
        first.extend_from_slice(&[0x00, 0x0A, 0x00, 0x05, 0xAA, 0xBB, 0xCC, 0xDD]);

        let mut decoder = FrameDecoder::new();
        let mut recorder = Recorder::default();
        decoder.feed(&first, &mut recorder);
        decoder.feed(&[0xEE, 0xFF, 0x11], &mut recorder);
        assert!(recorder.frames.is_empty());
        decoder.feed(&[0x22], &mut recorder);

        assert_eq!(
            recorder.frames,
            vec![(
                CMD_DATA_PACKET,
                vec![0x00, 0x05, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x11, 0x22],
            )]
        );
    }

    #[test]
    fn payload_continuation_smaller_than_a_header() {
        // Continuation chunks of 1..3 bytes must land in the payload
        // accumulator, not be mistaken for a header residue.
        let mut stream = Vec::from(CMD_DATA_PACKET);
        stream.extend_from_slice(&[0x00, 0x06, 0x00, 0x09, 1, 2, 3, 4]);
        let frames = decode_chunked(&stream, 5);
        assert_eq!(frames, vec![(CMD_DATA_PACKET, vec![0x00, 0x09, 1, 2, 3, 4])]);
    }

    #[test]
    fn two_frames_in_one_chunk_keep_order() {
        let mut chunk = encode_frame(CMD_CONNECT_SOCKET, &[0x00, 0x01]);
        chunk.extend_from_slice(&encode_frame(CMD_CONNECT_SOCKET, &[0x00, 0x02]));
        assert_eq!(chunk.len(), 12);

        let frames = decode_chunked(&chunk, chunk.len());
        assert_eq!(
            frames,
            vec![
                (CMD_CONNECT_SOCKET, vec![0x00, 0x01]),
                (CMD_CONNECT_SOCKET, vec![0x00, 0x02]),
            ]
        );
    }

    #[test]
    fn header_residue_completed_by_next_chunk_with_payload() {
        // One byte of header in the first chunk; the second chunk carries
        // the rest of the header plus the whole payload and the next frame.
        let mut stream = encode_frame(CMD_CONNECTION_RESP, &[0x00, 0x02, 0x00, 0x01]);
        stream.extend_from_slice(&encode_frame(CMD_CLOSE_ACCESSORY, &[]));

        let mut decoder = FrameDecoder::new();
        let mut recorder = Recorder::default();
        decoder.feed(&stream[..1], &mut recorder);
        decoder.feed(&stream[1..], &mut recorder);

        assert_eq!(
            recorder.frames,
            vec![
                (CMD_CONNECTION_RESP, vec![0x00, 0x02, 0x00, 0x01]),
                (CMD_CLOSE_ACCESSORY, vec![]),
            ]
        );
    }

    struct VecSink(std::sync::Mutex<Vec<Vec<u8>>>);

    impl CommandSink for VecSink {
        fn send_frame(&self, frame: &[u8]) -> Result<()> {
            self.0.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    #[test]
    fn sink_conveniences_build_frames() {
        let sink = VecSink(std::sync::Mutex::new(Vec::new()));
        sink.send_empty(CMD_CLOSE_ACCESSORY).unwrap();
        sink.send_u16(CMD_DISCONNECT_SOCKET, 0x0203).unwrap();
        let frames = sink.0.lock().unwrap();
        assert_eq!(frames[0], vec![0x00, 0x06, 0x00, 0x00]);
        assert_eq!(frames[1], vec![0x00, 0x02, 0x00, 0x02, 0x02, 0x03]);
    }
}
