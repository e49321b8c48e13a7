//! Free-client pool for rate mode
//!
//! A bounded stack of client indices that may be fired on the next rate
//! tick. Pushing a client twice or beyond capacity is a logic error and is
//! reported, never silently absorbed.

use crate::utils::PacingError;

#[derive(Debug, Clone)]
pub struct FreeClients {
    stack: Vec<usize>,
    member: Vec<bool>,
}

impl FreeClients {
    pub fn new(capacity: usize) -> Self {
        Self {
            stack: Vec::with_capacity(capacity),
            member: vec![false; capacity],
        }
    }

    /// Pool holding every client, lowest index on top
    pub fn filled(capacity: usize) -> Self {
        Self {
            stack: (0..capacity).rev().collect(),
            member: vec![true; capacity],
        }
    }

    pub fn push(&mut self, client: usize) -> Result<(), PacingError> {
        let capacity = self.capacity();
        match self.member.get_mut(client) {
            None => Err(PacingError::FreeListOverflow { client, capacity }),
            Some(true) => Err(PacingError::AlreadyFree(client)),
            Some(slot) => {
                *slot = true;
                self.stack.push(client);
                Ok(())
            }
        }
    }

    pub fn pop(&mut self) -> Result<usize, PacingError> {
        let client = self.stack.pop().ok_or(PacingError::FreeListUnderflow)?;
        self.member[client] = false;
        Ok(client)
    }

    pub fn contains(&self, client: usize) -> bool {
        self.member.get(client).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.member.len()
    }
}
