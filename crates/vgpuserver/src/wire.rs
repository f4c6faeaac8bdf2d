//! Framing of the outer socket protocol.
//!
//! Every request starts with two host-endian words, `{length, opcode}`,
//! followed by a payload whose size is fixed per opcode (or `length` words for
//! a command batch). Replies are raw words written back on the same socket.

use std::io::{self, Read, Write};

use vrend::{ResourceCreateArgs, TransferBox};

use crate::error::ProtocolError;

pub const HEADER_WORDS: usize = 2;
/// Busy-wait flag asking the server to block until all fences retired.
pub const BUSY_WAIT_FLAG_WAIT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    CreateRenderer = 1,
    GetCaps = 2,
    ResourceCreate = 3,
    ResourceDestroy = 4,
    TransferGet = 5,
    TransferPut = 6,
    SubmitCmd = 7,
    ResourceBusyWait = 8,
    FlushFrontbuffer = 9,
}

impl Opcode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Opcode::CreateRenderer,
            2 => Opcode::GetCaps,
            3 => Opcode::ResourceCreate,
            4 => Opcode::ResourceDestroy,
            5 => Opcode::TransferGet,
            6 => Opcode::TransferPut,
            7 => Opcode::SubmitCmd,
            8 => Opcode::ResourceBusyWait,
            9 => Opcode::FlushFrontbuffer,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in words for batches, ignored by most requests.
    pub length: u32,
    pub opcode: u32,
}

impl Header {
    pub fn new(opcode: Opcode, length: u32) -> Self {
        Self {
            length,
            opcode: opcode as u32,
        }
    }

    pub fn words(&self) -> [u32; HEADER_WORDS] {
        [self.length, self.opcode]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCreateRequest {
    pub args: ResourceCreateArgs,
    /// Bytes of shared memory the client wants as guest backing.
    pub size: u32,
}

impl ResourceCreateRequest {
    pub const WORDS: usize = 11;

    fn from_words(w: &[u32; Self::WORDS]) -> Self {
        Self {
            args: ResourceCreateArgs {
                handle: w[0],
                target: w[1],
                format: w[2],
                bind: w[3],
                width: w[4],
                height: w[5],
                depth: w[6],
                array_size: w[7],
                last_level: w[8],
                nr_samples: w[9],
                flags: 0,
            },
            size: w[10],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub handle: u32,
    pub level: u32,
    pub area: TransferBox,
    /// Byte offset into the resource's shared memory.
    pub offset: u32,
}

impl TransferRequest {
    pub const WORDS: usize = 10;

    fn from_words(w: &[u32; Self::WORDS]) -> Self {
        Self {
            handle: w[0],
            level: w[1],
            area: TransferBox::new([w[2], w[3], w[4]], [w[5], w[6], w[7]]),
            offset: w[9],
        }
    }
}

/// A fully read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CreateRenderer,
    GetCaps,
    ResourceCreate(ResourceCreateRequest),
    ResourceDestroy { handle: u32 },
    TransferGet(TransferRequest),
    TransferPut(TransferRequest),
    SubmitCmd(Vec<u32>),
    ResourceBusyWait { handle: u32, flags: u32 },
    FlushFrontbuffer { handle: u32, drawable: u32 },
}

impl Request {
    /// Reads the payload that follows `header`.
    ///
    /// Batches longer than `max_words` are refused before any of their words
    /// are read.
    pub fn read<R: Read>(
        reader: &mut R,
        header: Header,
        max_words: usize,
    ) -> Result<Self, ProtocolError> {
        let opcode =
            Opcode::from_raw(header.opcode).ok_or(ProtocolError::UnknownOpcode(header.opcode))?;
        let request = match opcode {
            Opcode::CreateRenderer => Request::CreateRenderer,
            Opcode::GetCaps => Request::GetCaps,
            Opcode::ResourceCreate => {
                let words = read_array::<_, { ResourceCreateRequest::WORDS }>(reader)?;
                Request::ResourceCreate(ResourceCreateRequest::from_words(&words))
            }
            Opcode::ResourceDestroy => {
                let [handle] = read_array::<_, 1>(reader)?;
                Request::ResourceDestroy { handle }
            }
            Opcode::TransferGet => {
                let words = read_array::<_, { TransferRequest::WORDS }>(reader)?;
                Request::TransferGet(TransferRequest::from_words(&words))
            }
            Opcode::TransferPut => {
                let words = read_array::<_, { TransferRequest::WORDS }>(reader)?;
                Request::TransferPut(TransferRequest::from_words(&words))
            }
            Opcode::SubmitCmd => {
                let len = header.length as usize;
                if len > max_words {
                    return Err(ProtocolError::BatchTooLarge {
                        words: len,
                        max: max_words,
                    });
                }
                let mut words = vec![0u32; len];
                read_words(reader, &mut words)?;
                Request::SubmitCmd(words)
            }
            Opcode::ResourceBusyWait => {
                let [handle, flags] = read_array::<_, 2>(reader)?;
                Request::ResourceBusyWait { handle, flags }
            }
            Opcode::FlushFrontbuffer => {
                let [handle, drawable] = read_array::<_, 2>(reader)?;
                Request::FlushFrontbuffer { handle, drawable }
            }
        };
        Ok(request)
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Request::CreateRenderer => Opcode::CreateRenderer,
            Request::GetCaps => Opcode::GetCaps,
            Request::ResourceCreate(_) => Opcode::ResourceCreate,
            Request::ResourceDestroy { .. } => Opcode::ResourceDestroy,
            Request::TransferGet(_) => Opcode::TransferGet,
            Request::TransferPut(_) => Opcode::TransferPut,
            Request::SubmitCmd(_) => Opcode::SubmitCmd,
            Request::ResourceBusyWait { .. } => Opcode::ResourceBusyWait,
            Request::FlushFrontbuffer { .. } => Opcode::FlushFrontbuffer,
        }
    }
}

/// Reads the next header. `None` means the peer closed the socket cleanly
/// between requests.
pub fn read_header<R: Read>(reader: &mut R) -> Result<Option<Header>, ProtocolError> {
    let mut words = [0u32; HEADER_WORDS];
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
    let mut filled = 0;
    while filled < bytes.len() {
        match reader.read(&mut bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ProtocolError::ShortRead),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(Some(Header {
        length: words[0],
        opcode: words[1],
    }))
}

pub fn read_words<R: Read>(reader: &mut R, words: &mut [u32]) -> Result<(), ProtocolError> {
    reader
        .read_exact(bytemuck::cast_slice_mut(words))
        .map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::ShortRead,
            _ => ProtocolError::Io(err),
        })
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u32; N], ProtocolError> {
    let mut words = [0u32; N];
    read_words(reader, &mut words)?;
    Ok(words)
}

pub fn write_words<W: Write>(writer: &mut W, words: &[u32]) -> io::Result<()> {
    writer.write_all(bytemuck::cast_slice(words))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(words: &[u32]) -> io::Cursor<Vec<u8>> {
        io::Cursor::new(bytemuck::cast_slice(words).to_vec())
    }

    #[test]
    fn clean_close_between_requests_is_not_an_error() {
        let mut empty = io::Cursor::new(Vec::new());
        assert!(read_header(&mut empty).unwrap().is_none());

        let mut partial = io::Cursor::new(vec![1u8, 0, 0]);
        assert!(matches!(
            read_header(&mut partial),
            Err(ProtocolError::ShortRead)
        ));
    }

    #[test]
    fn resource_create_payload_maps_to_args() {
        let mut input = stream(&[5, 0, 0, 1 << 17, 4096, 1, 1, 1, 0, 0, 4096]);
        let header = Header::new(Opcode::ResourceCreate, 0);
        let Request::ResourceCreate(req) = Request::read(&mut input, header, 16).unwrap() else {
            panic!("wrong request kind");
        };
        assert_eq!(req.args.handle, 5);
        assert_eq!(req.args.bind, 1 << 17);
        assert_eq!(req.args.width, 4096);
        assert_eq!(req.args.flags, 0);
        assert_eq!(req.size, 4096);
    }

    #[test]
    fn transfer_payload_skips_the_reserved_word() {
        let mut input = stream(&[9, 1, 2, 3, 0, 16, 8, 1, 0xdead, 64]);
        let header = Header::new(Opcode::TransferPut, 0);
        let request = Request::read(&mut input, header, 16).unwrap();
        assert_eq!(request.opcode(), Opcode::TransferPut);
        let Request::TransferPut(req) = request else {
            panic!("wrong request kind");
        };
        assert_eq!(req.level, 1);
        assert_eq!(req.area, TransferBox::new([2, 3, 0], [16, 8, 1]));
        assert_eq!(req.offset, 64);
    }

    #[test]
    fn oversized_batches_and_unknown_opcodes_are_refused() {
        let mut input = stream(&[0; 4]);
        let err = Request::read(&mut input, Header::new(Opcode::SubmitCmd, 4), 2).unwrap_err();
        assert!(matches!(err, ProtocolError::BatchTooLarge { words: 4, max: 2 }));

        let header = Header {
            length: 0,
            opcode: 42,
        };
        let err = Request::read(&mut input, header, 2).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOpcode(42)));
    }

    #[test]
    fn truncated_payload_is_a_short_read() {
        let mut input = stream(&[1]);
        let header = Header::new(Opcode::ResourceBusyWait, 0);
        assert!(matches!(
            Request::read(&mut input, header, 0),
            Err(ProtocolError::ShortRead)
        ));
    }
}
