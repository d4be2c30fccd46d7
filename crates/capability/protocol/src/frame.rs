//! TCP 块协议帧格式（全部大端）。
//!
//! ```text
//! 建链请求   [0x01, rack, slot]
//! 建链应答   [0x01, status]
//! 读块请求   [0x04, invoke_id:u16, block_id:u16, start:u32, length:u16]
//! 读块应答头 [0x04, invoke_id:u16, status:u8, length:u16] + length 字节数据
//! ```

pub const FN_OPEN: u8 = 0x01;
pub const FN_READ: u8 = 0x04;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_OUT_OF_RANGE: u8 = 0x05;

pub const OPEN_REQUEST_LEN: usize = 3;
pub const OPEN_RESPONSE_LEN: usize = 2;
pub const READ_REQUEST_LEN: usize = 11;
pub const READ_RESPONSE_HEADER_LEN: usize = 6;

/// 读块请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub invoke_id: u16,
    pub block_id: u16,
    pub start: u32,
    pub length: u16,
}

impl ReadRequest {
    pub fn encode(&self) -> [u8; READ_REQUEST_LEN] {
        let mut buf = [0u8; READ_REQUEST_LEN];
        buf[0] = FN_READ;
        buf[1..3].copy_from_slice(&self.invoke_id.to_be_bytes());
        buf[3..5].copy_from_slice(&self.block_id.to_be_bytes());
        buf[5..9].copy_from_slice(&self.start.to_be_bytes());
        buf[9..11].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; READ_REQUEST_LEN]) -> Option<Self> {
        if buf[0] != FN_READ {
            return None;
        }
        Some(Self {
            invoke_id: u16::from_be_bytes([buf[1], buf[2]]),
            block_id: u16::from_be_bytes([buf[3], buf[4]]),
            start: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
            length: u16::from_be_bytes([buf[9], buf[10]]),
        })
    }
}

/// 读块应答头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub invoke_id: u16,
    pub status: u8,
    pub length: u16,
}

impl ResponseHeader {
    pub fn encode(&self) -> [u8; READ_RESPONSE_HEADER_LEN] {
        let mut buf = [0u8; READ_RESPONSE_HEADER_LEN];
        buf[0] = FN_READ;
        buf[1..3].copy_from_slice(&self.invoke_id.to_be_bytes());
        buf[3] = self.status;
        buf[4..6].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; READ_RESPONSE_HEADER_LEN]) -> Option<Self> {
        if buf[0] != FN_READ {
            return None;
        }
        Some(Self {
            invoke_id: u16::from_be_bytes([buf[1], buf[2]]),
            status: buf[3],
            length: u16::from_be_bytes([buf[4], buf[5]]),
        })
    }
}
