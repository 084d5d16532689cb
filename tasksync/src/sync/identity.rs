use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub email: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }
}

/// Source of the authenticated identity. Only the current value and its
/// change stream are consumed.
pub trait IdentityProvider: Send + Sync {
    fn current(&self) -> Option<Identity>;
    fn changes(&self) -> watch::Receiver<Option<Identity>>;
}

/// Identity held in memory and set by hand. Backs offline mode and tests.
#[derive(Debug)]
pub struct IdentityCell {
    tx: watch::Sender<Option<Identity>>,
}

impl IdentityCell {
    pub fn new(initial: Option<Identity>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, identity: Option<Identity>) {
        self.tx.send_replace(identity);
    }
}

impl Default for IdentityCell {
    fn default() -> Self {
        Self::new(None)
    }
}

impl IdentityProvider for IdentityCell {
    fn current(&self) -> Option<Identity> {
        self.tx.borrow().clone()
    }

    fn changes(&self) -> watch::Receiver<Option<Identity>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cell_publishes_changes() {
        let cell = IdentityCell::default();
        let mut rx = cell.changes();
        assert_eq!(cell.current(), None);

        cell.set(Some(Identity::new("u1")));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().map(|i| i.id.as_str()), Some("u1"));
        assert_eq!(cell.current(), Some(Identity::new("u1")));
    }
}
