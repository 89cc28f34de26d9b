use anyhow::{Context, Result};
use log::debug;
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;

/// Modbus function code for "read input registers".
const READ_INPUT_REGISTERS: u8 = 0x04;
/// Every value on the meter is a 32-bit float spread over two registers.
const WORD_COUNT: u16 = 2;
const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Anything that can fetch one float register pair from a device.
pub trait RegisterReader {
    fn read(&mut self, device_address: u8, register: u16) -> Result<f32, ReadError>;
}

/// Byte stream the RTU client talks over.
pub trait Line: Read + Write {
    /// Drop whatever is waiting in the receive buffer.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl Line for Box<dyn serialport::SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

/// Serial line settings for the RTU transport.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub parity: serialport::Parity,
    pub stop_bits: serialport::StopBits,
    pub timeout: Duration,
}

/// Open a serial port with 8 data bits and the given line settings.
pub fn open_port(path: &str, settings: &SerialSettings) -> Result<Box<dyn serialport::SerialPort>> {
    serialport::new(path, settings.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(settings.parity)
        .stop_bits(settings.stop_bits)
        .timeout(settings.timeout)
        .open()
        .with_context(|| format!("Failed to open serial port {}", path))
}

/// Modbus RTU client over any byte stream. Issues exactly one request per
/// call and never retries.
pub struct RtuClient<S> {
    stream: S,
}

impl RtuClient<Box<dyn serialport::SerialPort>> {
    pub fn open(path: &str, settings: &SerialSettings) -> Result<Self> {
        Ok(Self::new(open_port(path, settings)?))
    }
}

impl<S: Line> RtuClient<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    fn exchange(&mut self, device_address: u8, register: u16) -> Result<[u8; 4], ReadError> {
        // A reply that missed the previous timeout would otherwise be taken
        // as the answer to this request.
        self.stream.discard_input()?;

        let request = build_request(device_address, register);
        self.stream.write_all(&request)?;
        self.stream.flush()?;

        // Address, function and either the byte count or the exception code.
        let mut head = [0u8; 3];
        self.stream.read_exact(&mut head)?;

        if head[1] & EXCEPTION_FLAG != 0 {
            let mut crc = [0u8; 2];
            self.stream.read_exact(&mut crc)?;
            let mut frame = head.to_vec();
            frame.extend_from_slice(&crc);
            check_crc(&frame)?;
            return Err(ReadError::UnexpectedResponse(format!(
                "exception code {:#04x} from device {}",
                head[2], head[0]
            )));
        }

        let byte_count = usize::from(head[2]);
        let mut rest = vec![0u8; byte_count + 2];
        self.stream.read_exact(&mut rest)?;

        let mut frame = head.to_vec();
        frame.extend_from_slice(&rest);
        debug!("RTU response: {:02x?}", frame);
        parse_response(&frame, device_address)
    }
}

impl<S: Line> RegisterReader for RtuClient<S> {
    fn read(&mut self, device_address: u8, register: u16) -> Result<f32, ReadError> {
        let data = self.exchange(device_address, register)?;
        Ok(f32::from_be_bytes(data))
    }
}

fn build_request(device_address: u8, register: u16) -> [u8; 8] {
    let [reg_hi, reg_lo] = register.to_be_bytes();
    let [cnt_hi, cnt_lo] = WORD_COUNT.to_be_bytes();
    let mut frame = [
        device_address,
        READ_INPUT_REGISTERS,
        reg_hi,
        reg_lo,
        cnt_hi,
        cnt_lo,
        0,
        0,
    ];
    let [crc_lo, crc_hi] = crc16(&frame[..6]).to_le_bytes();
    frame[6] = crc_lo;
    frame[7] = crc_hi;
    frame
}

/// Validate a complete response frame and return the four data bytes.
fn parse_response(frame: &[u8], device_address: u8) -> Result<[u8; 4], ReadError> {
    if frame.len() < 5 {
        return Err(ReadError::UnexpectedResponse(format!(
            "frame too short ({} bytes)",
            frame.len()
        )));
    }

    let body = check_crc(frame)?;
    if body[0] != device_address {
        return Err(ReadError::UnexpectedResponse(format!(
            "reply from device {} while {} was addressed",
            body[0], device_address
        )));
    }
    if body[1] != READ_INPUT_REGISTERS {
        return Err(ReadError::UnexpectedResponse(format!(
            "unexpected function code {:#04x}",
            body[1]
        )));
    }

    let data = &body[3..];
    if usize::from(body[2]) != data.len() || data.len() != usize::from(WORD_COUNT) * 2 {
        return Err(ReadError::UnexpectedResponse(format!(
            "expected {} registers, got {} bytes",
            WORD_COUNT,
            data.len()
        )));
    }

    Ok([data[0], data[1], data[2], data[3]])
}

/// Verify the trailing CRC and return the frame without it.
fn check_crc(frame: &[u8]) -> Result<&[u8], ReadError> {
    let (body, crc) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let received = u16::from_le_bytes([crc[0], crc[1]]);
    if expected != received {
        return Err(ReadError::UnexpectedResponse(format!(
            "CRC mismatch: expected {:#06x}, got {:#06x}",
            expected, received
        )));
    }
    Ok(body)
}

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF).
fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in bytes {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::ErrorKind;

    /// Half-duplex line: each request releases the next scripted reply into the
    /// receive buffer. Reading an empty buffer times out, after which a late
    /// reply (if any) shows up.
    #[derive(Default)]
    struct FakeLine {
        written: Vec<u8>,
        replies: VecDeque<Vec<u8>>,
        late: Option<Vec<u8>>,
        buffer: VecDeque<u8>,
    }

    impl FakeLine {
        fn replying(reply: Vec<u8>) -> Self {
            Self {
                replies: VecDeque::from([reply]),
                ..Self::default()
            }
        }
    }

    impl Read for FakeLine {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.buffer.is_empty() {
                if let Some(late) = self.late.take() {
                    self.buffer.extend(late);
                }
                return Err(io::Error::new(ErrorKind::TimedOut, "no reply"));
            }
            let n = buf.len().min(self.buffer.len());
            for (slot, byte) in buf.iter_mut().zip(self.buffer.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for FakeLine {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            if let Some(reply) = self.replies.pop_front() {
                self.buffer.extend(reply);
            }
            Ok(())
        }
    }

    impl Line for FakeLine {
        fn discard_input(&mut self) -> io::Result<()> {
            self.buffer.clear();
            Ok(())
        }
    }

    fn float_reply(value: f32) -> Vec<u8> {
        let mut body = vec![0x01, 0x04, 0x04];
        body.extend_from_slice(&value.to_be_bytes());
        with_crc(body)
    }

    fn with_crc(mut body: Vec<u8>) -> Vec<u8> {
        let crc = crc16(&body).to_le_bytes();
        body.extend_from_slice(&crc);
        body
    }

    #[test]
    fn crc_matches_reference_frame() {
        // Well-known frame: read input registers, device 1, register 0, 2 words.
        assert_eq!(build_request(1, 0), [0x01, 0x04, 0x00, 0x00, 0x00, 0x02, 0x71, 0xCB]);
    }

    #[test]
    fn request_encodes_register_big_endian() {
        let frame = build_request(0x02, 342);
        assert_eq!(&frame[..6], &[0x02, 0x04, 0x01, 0x56, 0x00, 0x02]);
    }

    #[test]
    fn reads_big_endian_float() {
        let mut client = RtuClient::new(FakeLine::replying(float_reply(231.5)));

        let read = client.read(1, 0).unwrap();
        assert_eq!(read, 231.5);
        assert_eq!(client.stream.written, build_request(1, 0).to_vec());
    }

    #[test]
    fn exception_frame_is_unexpected_response() {
        let reply = with_crc(vec![0x01, 0x84, 0x02]);
        let mut client = RtuClient::new(FakeLine::replying(reply));
        let err = client.read(1, 12).unwrap_err();
        assert!(matches!(err, ReadError::UnexpectedResponse(_)));
    }

    #[test]
    fn corrupted_exception_frame_is_a_crc_error() {
        let mut reply = with_crc(vec![0x01, 0x84, 0x02]);
        reply[4] ^= 0xFF;
        let mut client = RtuClient::new(FakeLine::replying(reply));
        match client.read(1, 12) {
            Err(ReadError::UnexpectedResponse(message)) => assert!(message.contains("CRC")),
            other => panic!("expected a CRC error, got {:?}", other),
        }
    }

    #[test]
    fn late_reply_is_not_taken_for_the_next_register() {
        let line = FakeLine {
            replies: VecDeque::from([Vec::new(), float_reply(640.0)]),
            late: Some(float_reply(12345.0)),
            ..FakeLine::default()
        };
        let mut client = RtuClient::new(line);

        assert!(matches!(client.read(1, 74), Err(ReadError::Transport(_))));
        assert_eq!(client.read(1, 12).unwrap(), 640.0);
    }

    #[test]
    fn stray_bytes_are_discarded_before_a_request() {
        let mut line = FakeLine::replying(float_reply(50.0));
        line.buffer.extend([0x01, 0x04]);
        let mut client = RtuClient::new(line);
        assert_eq!(client.read(1, 70).unwrap(), 50.0);
    }

    #[test]
    fn bad_crc_is_unexpected_response() {
        let mut reply = with_crc(vec![0x01, 0x04, 0x04, 0x43, 0x67, 0x80, 0x00]);
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        let mut client = RtuClient::new(FakeLine::replying(reply));
        assert!(matches!(
            client.read(1, 0),
            Err(ReadError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn wrong_register_count_is_unexpected_response() {
        let reply = with_crc(vec![0x01, 0x04, 0x02, 0x43, 0x67]);
        let mut client = RtuClient::new(FakeLine::replying(reply));
        assert!(matches!(
            client.read(1, 0),
            Err(ReadError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn reply_from_other_device_is_rejected() {
        let reply = with_crc(vec![0x05, 0x04, 0x04, 0x43, 0x67, 0x80, 0x00]);
        let mut client = RtuClient::new(FakeLine::replying(reply));
        assert!(matches!(
            client.read(1, 0),
            Err(ReadError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn silent_line_is_transport_error() {
        let mut client = RtuClient::new(FakeLine::replying(Vec::new()));
        assert!(matches!(client.read(1, 0), Err(ReadError::Transport(_))));
    }
}
