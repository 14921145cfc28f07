pub trait Input: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn as_bytes(&self) -> &[u8];
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
}

/// A single generated or mutated payload, owned by whichever pipeline stage
/// currently holds its batch.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Testcase {
    data: Vec<u8>,
}

impl Testcase {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// MD5 hex digest of the payload, used to identify testcases in logs.
    pub fn digest(&self) -> String {
        format!("{:x}", md5::compute(&self.data))
    }
}

impl From<Vec<u8>> for Testcase {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for Testcase {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

impl Input for Testcase {
    fn as_bytes(&self) -> &[u8] {
        &self.data
    }
    fn len(&self) -> usize {
        self.data.len()
    }
    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
