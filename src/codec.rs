//! Canonical binary encoding for transactions, headers and blocks.
//!
//! The wire format is a field-tagged, schema-versioned layout: every
//! message starts with a version byte, followed by `(field << 3) | kind`
//! tags where kind 0 is a varint and kind 2 is a length-delimited byte
//! string. Fields holding their default value are omitted, decoders
//! default missing numeric fields to zero and skip unknown fields, so
//! old and new nodes can exchange messages across schema revisions.

use primitive_types::U256;

use crate::errors::{ChainError, ChainResult};
use crate::types::{Block, BlockHeader, Sign, Transaction, TxType};

pub const CODEC_VERSION: u8 = 1;

const KIND_VARINT: u8 = 0;
const KIND_BYTES: u8 = 2;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self {
            buf: vec![CODEC_VERSION],
        }
    }

    fn put_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn tag(&mut self, field: u8, kind: u8) {
        self.buf.push((field << 3) | kind);
    }

    fn write_u64(&mut self, field: u8, value: u64) {
        if value == 0 {
            return;
        }
        self.tag(field, KIND_VARINT);
        self.put_varint(value);
    }

    fn write_bytes(&mut self, field: u8, value: &[u8]) {
        if value.is_empty() {
            return;
        }
        self.tag(field, KIND_BYTES);
        self.put_varint(value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    fn write_u256(&mut self, field: u8, value: &U256) {
        if value.is_zero() {
            return;
        }
        let mut be = [0u8; 32];
        value.to_big_endian(&mut be);
        let first = be.iter().position(|b| *b != 0).unwrap_or(31);
        self.write_bytes(field, &be[first..]);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> ChainResult<Self> {
        if buf.is_empty() {
            return Err(ChainError::Codec("empty message".into()));
        }
        let version = buf[0];
        if version == 0 || version > CODEC_VERSION {
            return Err(ChainError::Codec(format!(
                "unsupported codec version {version}"
            )));
        }
        Ok(Self { buf, pos: 1 })
    }

    fn read_varint(&mut self) -> ChainResult<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| ChainError::Codec("truncated varint".into()))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(ChainError::Codec("varint overflow".into()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_bytes(&mut self) -> ChainResult<&'a [u8]> {
        let len = self.read_varint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| ChainError::Codec("truncated byte field".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Next `(field, kind)` pair, or `None` at end of input.
    fn next_field(&mut self) -> ChainResult<Option<(u8, u8)>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let tag = self.buf[self.pos];
        self.pos += 1;
        let kind = tag & 0x07;
        if kind != KIND_VARINT && kind != KIND_BYTES {
            return Err(ChainError::Codec(format!("unknown wire kind {kind}")));
        }
        Ok(Some((tag >> 3, kind)))
    }

    fn skip(&mut self, kind: u8) -> ChainResult<()> {
        match kind {
            KIND_VARINT => self.read_varint().map(|_| ()),
            _ => self.read_bytes().map(|_| ()),
        }
    }
}

fn decode_u256(bytes: &[u8]) -> ChainResult<U256> {
    if bytes.len() > 32 {
        return Err(ChainError::Codec("integer field exceeds 256 bits".into()));
    }
    Ok(U256::from_big_endian(bytes))
}

fn hash_field(bytes: &[u8]) -> ChainResult<String> {
    if bytes.len() != 32 {
        return Err(ChainError::Codec(format!(
            "hash field must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(hex::encode(bytes))
}

fn encode_transaction_into(writer: &mut Writer, tx: &Transaction) -> ChainResult<()> {
    writer.write_bytes(1, &tx.data);
    writer.write_u256(2, &tx.value);
    writer.write_u64(3, tx.nonce);
    if let Some(target) = &tx.target {
        let bytes = hex::decode(target)
            .map_err(|err| ChainError::Codec(format!("invalid target encoding: {err}")))?;
        writer.write_bytes(4, &bytes);
    }
    writer.write_u64(5, tx.tx_type as u64);
    writer.write_u256(6, &tx.gas_limit);
    writer.write_u256(7, &tx.gas_price);
    let hash = hex::decode(&tx.hash)
        .map_err(|err| ChainError::Codec(format!("invalid tx hash encoding: {err}")))?;
    writer.write_bytes(8, &hash);
    if let Some(sign) = &tx.sign {
        writer.write_bytes(9, &sign.to_bytes()?);
    }
    Ok(())
}

fn decode_transaction_fields(reader: &mut Reader<'_>) -> ChainResult<Transaction> {
    let mut tx = Transaction {
        data: Vec::new(),
        value: U256::zero(),
        nonce: 0,
        target: None,
        tx_type: TxType::Transfer,
        gas_limit: U256::zero(),
        gas_price: U256::zero(),
        hash: String::new(),
        sign: None,
        source: None,
    };
    while let Some((field, kind)) = reader.next_field()? {
        match field {
            1 => tx.data = reader.read_bytes()?.to_vec(),
            2 => tx.value = decode_u256(reader.read_bytes()?)?,
            3 => tx.nonce = reader.read_varint()?,
            4 => tx.target = Some(hash_field(reader.read_bytes()?)?),
            5 => tx.tx_type = TxType::from_u8(reader.read_varint()? as u8)?,
            6 => tx.gas_limit = decode_u256(reader.read_bytes()?)?,
            7 => tx.gas_price = decode_u256(reader.read_bytes()?)?,
            8 => tx.hash = hash_field(reader.read_bytes()?)?,
            9 => tx.sign = Some(Sign::from_bytes(reader.read_bytes()?)?),
            _ => reader.skip(kind)?,
        }
    }
    Ok(tx)
}

pub fn encode_transaction(tx: &Transaction) -> ChainResult<Vec<u8>> {
    let mut writer = Writer::new();
    encode_transaction_into(&mut writer, tx)?;
    Ok(writer.finish())
}

pub fn decode_transaction(bytes: &[u8]) -> ChainResult<Transaction> {
    let mut reader = Reader::new(bytes)?;
    decode_transaction_fields(&mut reader)
}

pub fn encode_transactions(txs: &[Transaction]) -> ChainResult<Vec<u8>> {
    let mut writer = Writer::new();
    for tx in txs {
        writer.write_bytes(1, &encode_transaction(tx)?);
    }
    Ok(writer.finish())
}

pub fn decode_transactions(bytes: &[u8]) -> ChainResult<Vec<Transaction>> {
    let mut reader = Reader::new(bytes)?;
    let mut txs = Vec::new();
    while let Some((field, kind)) = reader.next_field()? {
        match field {
            1 => txs.push(decode_transaction(reader.read_bytes()?)?),
            _ => reader.skip(kind)?,
        }
    }
    Ok(txs)
}

fn encode_header_into(writer: &mut Writer, header: &BlockHeader) -> ChainResult<()> {
    let hash = hex::decode(&header.hash)
        .map_err(|err| ChainError::Codec(format!("invalid block hash encoding: {err}")))?;
    writer.write_bytes(1, &hash);
    writer.write_u64(2, header.height);
    let pre_hash = hex::decode(&header.pre_hash)
        .map_err(|err| ChainError::Codec(format!("invalid pre-hash encoding: {err}")))?;
    writer.write_bytes(3, &pre_hash);
    writer.write_u64(4, header.cur_time);
    let proposer = hex::decode(&header.proposer)
        .map_err(|err| ChainError::Codec(format!("invalid proposer encoding: {err}")))?;
    writer.write_bytes(5, &proposer);
    writer.write_u64(6, header.nonce);
    for (field, root) in [
        (7u8, &header.tx_tree),
        (8u8, &header.receipt_tree),
        (9u8, &header.state_tree),
    ] {
        let bytes = hex::decode(root)
            .map_err(|err| ChainError::Codec(format!("invalid merkle root encoding: {err}")))?;
        writer.write_bytes(field, &bytes);
    }
    writer.write_u64(10, header.base_target);
    writer.write_u256(11, &header.cumulative_difficulty);
    writer.write_bytes(12, &header.auth_code);
    if let Some(sign) = &header.sign {
        writer.write_bytes(13, &sign.to_bytes()?);
    }
    Ok(())
}

fn decode_header_fields(reader: &mut Reader<'_>) -> ChainResult<BlockHeader> {
    let mut header = BlockHeader {
        hash: String::new(),
        height: 0,
        pre_hash: String::new(),
        cur_time: 0,
        proposer: String::new(),
        nonce: 0,
        tx_tree: String::new(),
        receipt_tree: String::new(),
        state_tree: String::new(),
        base_target: 0,
        cumulative_difficulty: U256::zero(),
        auth_code: Vec::new(),
        sign: None,
    };
    while let Some((field, kind)) = reader.next_field()? {
        match field {
            1 => header.hash = hash_field(reader.read_bytes()?)?,
            2 => header.height = reader.read_varint()?,
            3 => header.pre_hash = hash_field(reader.read_bytes()?)?,
            4 => header.cur_time = reader.read_varint()?,
            5 => header.proposer = hash_field(reader.read_bytes()?)?,
            6 => header.nonce = reader.read_varint()?,
            7 => header.tx_tree = hash_field(reader.read_bytes()?)?,
            8 => header.receipt_tree = hash_field(reader.read_bytes()?)?,
            9 => header.state_tree = hash_field(reader.read_bytes()?)?,
            10 => header.base_target = reader.read_varint()?,
            11 => header.cumulative_difficulty = decode_u256(reader.read_bytes()?)?,
            12 => header.auth_code = reader.read_bytes()?.to_vec(),
            13 => header.sign = Some(Sign::from_bytes(reader.read_bytes()?)?),
            _ => reader.skip(kind)?,
        }
    }
    Ok(header)
}

pub fn encode_block_header(header: &BlockHeader) -> ChainResult<Vec<u8>> {
    let mut writer = Writer::new();
    encode_header_into(&mut writer, header)?;
    Ok(writer.finish())
}

pub fn decode_block_header(bytes: &[u8]) -> ChainResult<BlockHeader> {
    let mut reader = Reader::new(bytes)?;
    decode_header_fields(&mut reader)
}

pub fn encode_block(block: &Block) -> ChainResult<Vec<u8>> {
    let mut writer = Writer::new();
    writer.write_bytes(1, &encode_block_header(&block.header)?);
    for tx in &block.transactions {
        writer.write_bytes(2, &encode_transaction(tx)?);
    }
    Ok(writer.finish())
}

pub fn decode_block(bytes: &[u8]) -> ChainResult<Block> {
    let mut reader = Reader::new(bytes)?;
    let mut header = None;
    let mut transactions = Vec::new();
    while let Some((field, kind)) = reader.next_field()? {
        match field {
            1 => header = Some(decode_block_header(reader.read_bytes()?)?),
            2 => transactions.push(decode_transaction(reader.read_bytes()?)?),
            _ => reader.skip(kind)?,
        }
    }
    let header = header.ok_or_else(|| ChainError::Codec("block without header".into()))?;
    Ok(Block {
        header,
        transactions,
    })
}

pub fn encode_blocks(blocks: &[Block]) -> ChainResult<Vec<u8>> {
    let mut writer = Writer::new();
    for block in blocks {
        writer.write_bytes(1, &encode_block(block)?);
    }
    Ok(writer.finish())
}

pub fn decode_blocks(bytes: &[u8]) -> ChainResult<Vec<Block>> {
    let mut reader = Reader::new(bytes)?;
    let mut blocks = Vec::new();
    while let Some((field, kind)) = reader.next_field()? {
        match field {
            1 => blocks.push(decode_block(reader.read_bytes()?)?),
            _ => reader.skip(kind)?,
        }
    }
    Ok(blocks)
}

pub fn encode_block_headers(headers: &[BlockHeader]) -> ChainResult<Vec<u8>> {
    let mut writer = Writer::new();
    for header in headers {
        writer.write_bytes(1, &encode_block_header(header)?);
    }
    Ok(writer.finish())
}

pub fn decode_block_headers(bytes: &[u8]) -> ChainResult<Vec<BlockHeader>> {
    let mut reader = Reader::new(bytes)?;
    let mut headers = Vec::new();
    while let Some((field, kind)) = reader.next_field()? {
        match field {
            1 => headers.push(decode_block_header(reader.read_bytes()?)?),
            _ => reader.skip(kind)?,
        }
    }
    Ok(headers)
}
