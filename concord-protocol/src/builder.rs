//! Transaction builder for one driver call.
//!
//! Accumulates spent inputs and new outputs; exclusive to the calling task.

use concord_core::{Output, Transaction, UtxoRef};

/// Builds the single transaction a driver call assembles.
#[derive(Debug, Default)]
pub struct TransactionBuilder {
    inputs: Vec<(UtxoRef, Output)>,
    outputs: Vec<Output>,
}

impl TransactionBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spend an output. Returns the input index.
    pub fn add_input(&mut self, output_ref: UtxoRef, output: Output) -> usize {
        self.inputs.push((output_ref, output));
        self.inputs.len() - 1
    }

    /// Add an output. Returns the output index.
    pub fn add_output(&mut self, output: Output) -> usize {
        self.outputs.push(output);
        self.outputs.len() - 1
    }

    /// Number of inputs added so far.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Number of outputs added so far.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Whether anything has been added.
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    /// Assemble the transaction.
    pub fn build(self) -> Transaction {
        Transaction {
            inputs: self.inputs.into_iter().map(|(r, _)| r).collect(),
            outputs: self.outputs,
        }
    }
}
