use bytes::Bytes;

/// A single message read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Position of the message within its partition.
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl Message {
    /// Payload length as fed into the per-topic fetch-size hint.
    pub fn payload_len(&self) -> i32 {
        i32::try_from(self.value.len()).unwrap_or(i32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_len_matches_value() {
        let msg = Message {
            offset: 3,
            key: Some(Bytes::from_static(b"k")),
            value: Bytes::from(vec![0; 45]),
        };
        assert_eq!(msg.payload_len(), 45);
    }
}
