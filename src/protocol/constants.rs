//! Useful protocol constants.

/// Mean of the Poisson traffic processes when the configuration does not
/// override them; the mean time in seconds between two emails in the dataset.
pub const DEFAULT_LAMBDA: f64 = 7.879036505057893;

/// Length of a node or user identifier on the wire: one kind letter followed
/// by six zero-padded digits.
pub const ID_LEN: usize = 7;

/// Length of a message identifier: 12 random bytes, hex encoded.
pub const MSG_ID_LEN: usize = 24;

/// Length of a split identifier: five zero-padded digits.
pub const SPLIT_LEN: usize = 5;

/// The split identifier of a single-packet message.
pub const FIRST_SPLIT: &str = "00000";

/// Byte-string which terminates a node's UDP listener.
pub const TERMINATE_SIMULATION: &[u8] = b"TERMINATE_SIMULATION";

/// Characters from which random plaintexts are drawn.
pub const PLAINTEXT_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789\
      !\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~ ";
