//! Objective-C method-type decoding.
//!
//! Method signatures arrive as compact type-encoding strings (`"i@:i"`, with
//! optional frame-offset annotations between entries). The decoder walks one
//! encoding left to right and yields the byte size of each successive type.
//! Only the subset the marshaller can represent is recognised; anything else
//! is reported as malformed so the calling hook can refuse the dispatch.

use tracing::error;

/// Streaming decoder over one method-type encoding.
pub struct TypeDecoder<'a> {
    t: &'a [u8],
    pos: usize,
}

impl<'a> TypeDecoder<'a> {
    pub fn new(encoding: &'a str) -> Self {
        Self {
            t: encoding.as_bytes(),
            pos: 0,
        }
    }

    pub fn has_next(&self) -> bool {
        self.pos < self.t.len()
    }

    /// Size in bytes of the next encoded type, or `None` when the encoding
    /// is malformed or uses an unsupported construct.
    pub fn next_size(&mut self) -> Option<usize> {
        let size = self.size_impl();

        // The cursor rests on the last byte of the decoded type; step past
        // it, then past any frame-offset annotation.
        self.pos += 1;
        while matches!(self.t.get(self.pos), Some(b'0'..=b'9') | Some(b' ')) {
            self.pos += 1;
        }

        size
    }

    // Leaves the cursor on the last byte of the type it decoded.
    fn size_impl(&mut self) -> Option<usize> {
        match self.t.get(self.pos).copied() {
            Some(b'v') => Some(0),
            Some(b'c') | Some(b'@') | Some(b':') | Some(b'i') | Some(b'I') | Some(b'f') => Some(4),
            Some(b'^') => {
                // Pointer: the pointee type must be consumed but its size is
                // irrelevant, a pointer is always one word.
                self.pos += 1;
                self.size_impl()?;
                Some(4)
            }
            Some(b'{') => {
                // Struct: skip the name up to `=`, then sum the field sizes
                // until the closing brace. An empty struct is legal.
                self.pos += 1;
                loop {
                    match self.t.get(self.pos) {
                        Some(b'=') => break,
                        Some(_) => self.pos += 1,
                        None => {
                            error!("struct type ended unexpectedly");
                            return None;
                        }
                    }
                }
                self.pos += 1;

                let mut total = 0;
                while self.t.get(self.pos) != Some(&b'}') {
                    if self.pos >= self.t.len() {
                        error!("struct type ended unexpectedly");
                        return None;
                    }
                    total += self.next_size()?;
                }
                Some(total)
            }
            Some(other) => {
                error!("unsupported type encoding {:?}", other as char);
                None
            }
            None => {
                error!("type encoding ended unexpectedly");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(encoding: &str) -> Vec<Option<usize>> {
        let mut td = TypeDecoder::new(encoding);
        let mut out = Vec::new();
        while td.has_next() {
            out.push(td.next_size());
        }
        out
    }

    #[test]
    fn void_is_empty() {
        assert_eq!(sizes("v"), vec![Some(0)]);
    }

    #[test]
    fn word_sized_scalars() {
        assert_eq!(
            sizes("c@:iIf"),
            vec![Some(4), Some(4), Some(4), Some(4), Some(4), Some(4)]
        );
    }

    #[test]
    fn pointers_are_one_word() {
        assert_eq!(sizes("^i"), vec![Some(4)]);
        assert_eq!(sizes("^^i"), vec![Some(4)]);
    }

    #[test]
    fn structs_sum_their_fields() {
        assert_eq!(sizes("{S=ii}"), vec![Some(8)]);
        assert_eq!(sizes("{S=}"), vec![Some(0)]);
        assert_eq!(sizes("{S=^v i}"), vec![Some(8)]);
        assert_eq!(sizes("{Outer={Inner=ii}i}"), vec![Some(12)]);
    }

    #[test]
    fn frame_offsets_are_skipped() {
        assert_eq!(sizes("v12@0:4i8"), vec![Some(0), Some(4), Some(4), Some(4)]);
    }

    #[test]
    fn malformed_encodings_are_invalid() {
        assert_eq!(sizes("{S"), vec![None]);
        assert_eq!(sizes("q"), vec![None]);
        assert_eq!(sizes("{S=q}"), vec![None]);
    }
}
