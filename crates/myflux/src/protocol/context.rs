//! Decode context: tells the decoder how to interpret the next message.
//!
//! The same first byte means different things in different phases (0xFE is
//! an EOF, an OK, or a column-count header depending on where the exchange
//! stands). The context only carries state; transitions are driven by the
//! query flows in response to decoded messages.

/// Per-exchange decode state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeContext {
    /// Connection phase: handshake and authentication messages
    Connection,
    /// Command phase, idle: OK / ERR / column count
    Command,
    /// After COM_STMT_PREPARE: ERR or prepared-ok
    WaitPrepare,
    /// Reading prepared-statement parameter and column definitions
    PrepMetadata {
        param_total: u16,
        col_total: u16,
        remaining_params: u16,
        remaining_cols: u16,
    },
    /// Reading result-set column definitions
    ResultMetadata { col_total: u64, remaining_cols: u64 },
    /// Reading result rows
    ResultRows { cols: u64, binary: bool },
}

impl DecodeContext {
    /// Start reading prepared-statement metadata.
    pub fn prep_metadata(param_total: u16, col_total: u16) -> Self {
        DecodeContext::PrepMetadata {
            param_total,
            col_total,
            remaining_params: param_total,
            remaining_cols: col_total,
        }
    }

    /// Start reading result-set metadata.
    pub fn result_metadata(col_total: u64) -> Self {
        DecodeContext::ResultMetadata {
            col_total,
            remaining_cols: col_total,
        }
    }

    /// Whether this context reads column-definition messages.
    pub fn is_metadata(&self) -> bool {
        matches!(
            self,
            DecodeContext::PrepMetadata { .. } | DecodeContext::ResultMetadata { .. }
        )
    }

    /// Whether this context reads row messages.
    pub fn is_rows(&self) -> bool {
        matches!(self, DecodeContext::ResultRows { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_seed_remaining_counts() {
        let ctx = DecodeContext::prep_metadata(2, 3);
        assert_eq!(
            ctx,
            DecodeContext::PrepMetadata {
                param_total: 2,
                col_total: 3,
                remaining_params: 2,
                remaining_cols: 3,
            }
        );
        assert!(ctx.is_metadata());

        let ctx = DecodeContext::result_metadata(4);
        assert!(ctx.is_metadata());
        assert!(!ctx.is_rows());

        let ctx = DecodeContext::ResultRows {
            cols: 4,
            binary: true,
        };
        assert!(ctx.is_rows());
    }
}
