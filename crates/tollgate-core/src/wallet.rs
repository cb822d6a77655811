//! Wallet boundary
//!
//! The core treats payment as two opaque, possibly-failing async calls:
//! producing a proof of payment for quoted terms, and verifying/settling
//! a proof or token someone handed us. Cryptographic validation of the
//! artifacts lives entirely in the wallet implementation.

use crate::{proto::PaymentTerms, Result};
use std::future::Future;

/// Futures are required to be Send because the peer layer awaits them
/// from spawned tasks.
pub trait Wallet: Send + Sync {
    /// Obtain a proof of payment for the quoted terms (pays the invoice
    /// or mints a token). Fails with `PaymentUnavailable` when the wallet
    /// cannot produce one.
    fn proof_for_terms(
        &self,
        terms: &PaymentTerms,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Verify that `token` covers `amount` and settle it. `Ok(false)`
    /// means the artifact was readable but insufficient.
    fn verify_and_settle(
        &self,
        token: &str,
        amount: u64,
    ) -> impl Future<Output = Result<bool>> + Send;
}

impl<W: Wallet> Wallet for std::sync::Arc<W> {
    fn proof_for_terms(
        &self,
        terms: &PaymentTerms,
    ) -> impl Future<Output = Result<String>> + Send {
        (**self).proof_for_terms(terms)
    }

    fn verify_and_settle(
        &self,
        token: &str,
        amount: u64,
    ) -> impl Future<Output = Result<bool>> + Send {
        (**self).verify_and_settle(token, amount)
    }
}

pub mod mock {
    //! Mock wallet for testing

    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// A mock wallet with configurable behavior
    pub struct MockWallet {
        /// Whether proof_for_terms succeeds
        pay: bool,
        /// Whether verify_and_settle accepts
        accept: bool,
        counter: AtomicU64,
        /// Proofs this wallet issued
        issued: Mutex<Vec<String>>,
        /// (token, amount) pairs this wallet settled
        settled: Mutex<Vec<(String, u64)>>,
    }

    impl MockWallet {
        /// A wallet that pays everything and accepts everything
        pub fn new() -> Self {
            Self::with_behavior(true, true)
        }

        pub fn with_behavior(pay: bool, accept: bool) -> Self {
            Self {
                pay,
                accept,
                counter: AtomicU64::new(1),
                issued: Mutex::new(Vec::new()),
                settled: Mutex::new(Vec::new()),
            }
        }

        /// A wallet that can never produce a proof
        pub fn broke() -> Self {
            Self::with_behavior(false, true)
        }

        /// A wallet that rejects every proof shown to it
        pub fn distrustful() -> Self {
            Self::with_behavior(true, false)
        }

        pub fn issued_proofs(&self) -> Vec<String> {
            self.issued.lock().unwrap().clone()
        }

        pub fn settlements(&self) -> Vec<(String, u64)> {
            self.settled.lock().unwrap().clone()
        }
    }

    impl Default for MockWallet {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Wallet for MockWallet {
        async fn proof_for_terms(&self, terms: &PaymentTerms) -> Result<String> {
            if !self.pay {
                return Err(Error::PaymentUnavailable(
                    "mock wallet has no funds".to_string(),
                ));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let proof = format!("mock-proof-{}-{}", n, terms.amount);
            self.issued.lock().unwrap().push(proof.clone());
            Ok(proof)
        }

        async fn verify_and_settle(&self, token: &str, amount: u64) -> Result<bool> {
            self.settled
                .lock()
                .unwrap()
                .push((token.to_string(), amount));
            Ok(self.accept)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn terms(amount: u64) -> PaymentTerms {
            PaymentTerms {
                mode: crate::PaymentMode::Prepay as i32,
                amount,
                unit: "sat".to_string(),
                rate: 100,
                size_bytes: 1024,
                methods: vec!["lightning".to_string()],
            }
        }

        #[tokio::test]
        async fn test_mock_wallet_pays_and_settles() {
            let wallet = MockWallet::new();
            let proof = wallet.proof_for_terms(&terms(21)).await.unwrap();
            assert!(proof.contains("21"));
            assert_eq!(wallet.issued_proofs().len(), 1);

            assert!(wallet.verify_and_settle(&proof, 21).await.unwrap());
            assert_eq!(wallet.settlements(), vec![(proof, 21)]);
        }

        #[tokio::test]
        async fn test_broke_wallet_cannot_pay() {
            let wallet = MockWallet::broke();
            assert!(matches!(
                wallet.proof_for_terms(&terms(1)).await,
                Err(Error::PaymentUnavailable(_))
            ));
        }

        #[tokio::test]
        async fn test_distrustful_wallet_rejects() {
            let wallet = MockWallet::distrustful();
            assert!(!wallet.verify_and_settle("proof", 5).await.unwrap());
        }
    }
}
