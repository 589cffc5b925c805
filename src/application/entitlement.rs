use std::sync::Arc;

use tracing::debug;

use crate::api::{Billing, InvoiceStatus};
use crate::domain::{DownloadError, EntitlementResult, EntitlementStatus};

/// Decides whether a user may download a resource, from live invoice state.
///
/// Results are never cached: payment state is owned by the billing service
/// and may change between two attempts.
#[derive(Clone)]
pub struct EntitlementGate {
    billing: Arc<dyn Billing>,
}

impl EntitlementGate {
    pub fn new(billing: Arc<dyn Billing>) -> Self {
        Self { billing }
    }

    /// Checks the invoice for (`user_id`, `resource_id`), creating one if
    /// none exists yet.
    pub async fn check(
        &self,
        user_id: &str,
        resource_id: &str,
        description: &str,
    ) -> Result<EntitlementResult, DownloadError> {
        let result = match self.billing.get_invoice(user_id, resource_id).await? {
            None => {
                let invoice_id = self
                    .billing
                    .create_invoice(user_id, resource_id, description)
                    .await?;
                debug!(user_id, resource_id, %invoice_id, "created invoice");
                EntitlementResult {
                    authorized: false,
                    invoice_id: Some(invoice_id),
                    status: EntitlementStatus::None,
                }
            }
            Some(invoice) if invoice.status == InvoiceStatus::Paid => EntitlementResult {
                authorized: true,
                invoice_id: Some(invoice.id),
                status: EntitlementStatus::Paid,
            },
            Some(invoice) => EntitlementResult {
                authorized: false,
                invoice_id: Some(invoice.id),
                status: EntitlementStatus::Pending,
            },
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::api::{self, Invoice};

    #[derive(Default)]
    struct FakeBilling {
        invoices: Mutex<HashMap<(String, String), Invoice>>,
        created: Mutex<u32>,
    }

    #[async_trait]
    impl Billing for FakeBilling {
        async fn get_invoice(&self, user: &str, resource: &str) -> api::Result<Option<Invoice>> {
            Ok(self
                .invoices
                .lock()
                .unwrap()
                .get(&(user.to_string(), resource.to_string()))
                .cloned())
        }

        async fn create_invoice(&self, user: &str, resource: &str, _: &str) -> api::Result<String> {
            let mut created = self.created.lock().unwrap();
            *created += 1;
            let id = format!("INV-{}", *created);
            self.invoices.lock().unwrap().insert(
                (user.to_string(), resource.to_string()),
                Invoice {
                    id: id.clone(),
                    status: InvoiceStatus::Pending,
                },
            );
            Ok(id)
        }
    }

    impl FakeBilling {
        fn set(&self, user: &str, resource: &str, id: &str, status: InvoiceStatus) {
            self.invoices.lock().unwrap().insert(
                (user.to_string(), resource.to_string()),
                Invoice {
                    id: id.to_string(),
                    status,
                },
            );
        }
    }

    #[tokio::test]
    async fn test_no_invoice_creates_one() {
        let billing = Arc::new(FakeBilling::default());
        let gate = EntitlementGate::new(billing.clone());

        let result = gate.check("U", "song-42", "Midnight").await.unwrap();

        assert!(!result.authorized);
        assert_eq!(result.status, EntitlementStatus::None);
        assert_eq!(result.invoice_id.as_deref(), Some("INV-1"));
        assert_eq!(*billing.created.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unpaid_invoices_are_pending() {
        let billing = Arc::new(FakeBilling::default());
        billing.set("U", "a", "INV-A", InvoiceStatus::Pending);
        billing.set("U", "b", "INV-B", InvoiceStatus::Canceled);
        let gate = EntitlementGate::new(billing.clone());

        for (resource, id) in [("a", "INV-A"), ("b", "INV-B")] {
            let result = gate.check("U", resource, "").await.unwrap();
            assert!(!result.authorized);
            assert_eq!(result.status, EntitlementStatus::Pending);
            assert_eq!(result.invoice_id.as_deref(), Some(id));
        }
        assert_eq!(*billing.created.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_paid_invoice_authorizes_and_is_rechecked() {
        let billing = Arc::new(FakeBilling::default());
        billing.set("U", "a", "INV-A", InvoiceStatus::Paid);
        let gate = EntitlementGate::new(billing.clone());

        assert!(gate.check("U", "a", "").await.unwrap().authorized);

        billing.set("U", "a", "INV-A", InvoiceStatus::Canceled);
        assert!(!gate.check("U", "a", "").await.unwrap().authorized);
    }
}
