use std::io::{BufRead, ErrorKind};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    BetweenElements,
    Done,
}

/// Pull iterator over the elements of a top-level JSON array.
///
/// Elements are sliced out of the byte stream one at a time and decoded on demand,
/// so a malformed element yields an `Err` for that element only and iteration
/// continues with the next one. A broken array structure (missing `[`, unbalanced
/// brackets, truncated input) ends the iteration after one error.
///
/// The iterator cannot rewind; re-reading requires opening the source again.
pub struct JsonRecords<R, T> {
    reader: R,
    state: State,
    buf: Vec<u8>,
    index: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<R: BufRead, T: DeserializeOwned> JsonRecords<R, T> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: State::Start,
            buf: Vec::new(),
            index: 0,
            _marker: PhantomData,
        }
    }

    /// Index of the next element to be yielded.
    pub fn position(&self) -> u64 {
        self.index
    }

    fn peek_byte(&mut self) -> Result<Option<u8>> {
        loop {
            let available = match self.reader.fill_buf() {
                Ok(b) => b,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            return Ok(available.first().copied());
        }
    }

    fn skip_whitespace(&mut self) -> Result<Option<u8>> {
        while let Some(b) = self.peek_byte()? {
            if !b.is_ascii_whitespace() {
                return Ok(Some(b));
            }
            self.reader.consume(1);
        }
        Ok(None)
    }

    /// Copies one complete JSON value into `self.buf`.
    fn read_value(&mut self) -> Result<()> {
        self.buf.clear();
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        loop {
            let Some(b) = self.peek_byte()? else {
                return Err(Error::incompatible("unexpected end of json array"));
            };

            if !in_string && depth == 0 && matches!(b, b',' | b']') {
                if self.buf.is_empty() {
                    return Err(Error::incompatible("empty json array element"));
                }
                return Ok(());
            }

            self.reader.consume(1);
            self.buf.push(b);

            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }

            match b {
                b'"' => in_string = true,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| Error::incompatible("unbalanced json brackets"))?;
                }
                _ => {}
            }
        }
    }

    fn advance(&mut self) -> Result<Option<()>> {
        match self.state {
            State::Done => return Ok(None),
            State::Start => {
                match self.skip_whitespace()? {
                    Some(b'[') => self.reader.consume(1),
                    Some(_) => return Err(Error::incompatible("json records must be an array")),
                    None => return Err(Error::incompatible("json records source is empty")),
                }
                if self.skip_whitespace()? == Some(b']') {
                    self.reader.consume(1);
                    self.state = State::Done;
                    return Ok(None);
                }
            }
            State::BetweenElements => match self.skip_whitespace()? {
                Some(b',') => {
                    self.reader.consume(1);
                    self.skip_whitespace()?;
                }
                Some(b']') => {
                    self.reader.consume(1);
                    self.state = State::Done;
                    return Ok(None);
                }
                Some(other) => {
                    return Err(Error::incompatible(format!(
                        "unexpected byte {:?} between json records",
                        other as char
                    )));
                }
                None => return Err(Error::incompatible("unexpected end of json array")),
            },
        }

        self.read_value()?;
        self.state = State::BetweenElements;
        Ok(Some(()))
    }
}

impl<R: BufRead, T: DeserializeOwned> Iterator for JsonRecords<R, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(None) => None,
            Ok(Some(())) => {
                self.index += 1;
                Some(serde_json::from_slice(&self.buf).map_err(Error::from))
            }
            Err(e) => {
                self.state = State::Done;
                Some(Err(e))
            }
        }
    }
}
