use listen_common::listen::Listen;

/// A sealed, ordered group of listens written with a single insert statement.
#[derive(Debug)]
pub struct Batch {
    sequence: u64,
    listens: Box<[Listen]>,
}

impl Batch {
    /// Position of this batch in the stream, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn listens(&self) -> &[Listen] {
        &self.listens
    }

    pub fn len(&self) -> usize {
        self.listens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listens.is_empty()
    }
}

/// Groups emitted listens into batches of `batch_size`.
pub struct BatchAccumulator {
    batch_size: usize,
    next_sequence: u64,
    current: Vec<Listen>,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            next_sequence: 0,
            current: Vec::with_capacity(batch_size),
        }
    }

    /// Add a listen, returning the sealed batch once it is full.
    pub fn push(&mut self, listen: Listen) -> Option<Batch> {
        self.current.push(listen);
        if self.current.len() >= self.batch_size {
            return Some(self.seal());
        }
        None
    }

    /// Seal whatever is left at the end of the stream.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.current.is_empty() {
            return None;
        }
        Some(self.seal())
    }

    pub fn pending(&self) -> usize {
        self.current.len()
    }

    fn seal(&mut self) -> Batch {
        let listens = std::mem::replace(&mut self.current, Vec::with_capacity(self.batch_size));
        let batch = Batch {
            sequence: self.next_sequence,
            listens: listens.into_boxed_slice(),
        };
        self.next_sequence += 1;
        batch
    }
}
