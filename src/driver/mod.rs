// Module: Driver
// Boundary between the sync engine and the browser that drives the remote ERP.

pub mod webdriver;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::DriverResult;
use crate::protocol::FormField;
use crate::wait::await_condition;

/// Login credentials for the remote system.
#[derive(Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Menu path that opens the records module after login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulePath {
    pub menu: String,
    pub item: String,
}

/// A row of the listing grid, as currently rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowHandle {
    /// Position within the current page.
    pub position: usize,
    /// Key text exactly as displayed (may carry thousands separators).
    pub key_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogKind {
    Success,
    Error,
    Confirm,
}

/// Modal or toast currently shown by the remote UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialog {
    pub kind: DialogKind,
    pub text: String,
}

impl Dialog {
    #[cfg(test)]
    pub fn success(text: impl Into<String>) -> Self {
        Self { kind: DialogKind::Success, text: text.into() }
    }

    #[cfg(test)]
    pub fn error(text: impl Into<String>) -> Self {
        Self { kind: DialogKind::Error, text: text.into() }
    }

    /// Error text that points at the CNPJ/CPF field.
    pub fn mentions_document(&self) -> bool {
        let text = self.text.to_lowercase();
        ["cpf", "cnpj", "inválido", "invalido"]
            .iter()
            .any(|needle| text.contains(needle))
    }
}

/// Buttons of the edit form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiAction {
    Save,
    Back,
}

/// Compares a displayed key with a business key.
///
/// Whitespace and thousands separators (`.` and `,`) are ignored on both
/// sides. Only full equality counts: `"12"` never matches `"123"`.
pub fn keys_match(displayed: &str, key: &str) -> bool {
    fn clean(s: &str) -> String {
        s.chars()
            .filter(|c| !c.is_whitespace() && *c != '.' && *c != ',')
            .collect()
    }
    let displayed = clean(displayed);
    !displayed.is_empty() && displayed == clean(key)
}

/// Trait that abstracts the remote UI.
///
/// Every operation may fail with a `DriverError`; callers translate those
/// into record failures. Implementations must be usable from one task at a
/// time, which is how each worker owns its session.
#[async_trait]
pub trait RemoteDriver: Send + Sync {
    async fn navigate_to(&self, url: &str) -> DriverResult<()>;

    async fn login(&self, credentials: &Credentials) -> DriverResult<()>;

    async fn open_module(&self, path: &ModulePath) -> DriverResult<()>;

    /// Types the key in the quick search box and submits it.
    async fn search(&self, key: &str) -> DriverResult<()>;

    async fn visible_rows(&self) -> DriverResult<Vec<RowHandle>>;

    /// True when the listing explicitly reports "no records".
    async fn listing_empty(&self) -> DriverResult<bool>;

    async fn listing_visible(&self) -> DriverResult<bool>;

    async fn click_edit(&self, row: &RowHandle) -> DriverResult<()>;

    async fn field_visible(&self, field: FormField) -> DriverResult<bool>;

    async fn read_field(&self, field: FormField) -> DriverResult<String>;

    /// Writes the value and fires the input/change/blur events the form listens to.
    async fn set_field(&self, field: FormField, value: &str) -> DriverResult<()>;

    async fn set_radio(&self, group: &str, value: &str) -> DriverResult<()>;

    async fn set_select(&self, name: &str, value: &str) -> DriverResult<()>;

    async fn click(&self, action: UiAction) -> DriverResult<()>;

    async fn detect_dialog(&self) -> DriverResult<Option<Dialog>>;

    /// Clicks the confirm button of the visible dialog. False when none was shown.
    async fn dismiss_dialog(&self) -> DriverResult<bool>;

    async fn go_back(&self) -> DriverResult<()> {
        self.click(UiAction::Back).await
    }

    async fn sort_ascending_by(&self, column: &str) -> DriverResult<()>;

    async fn first_page(&self) -> DriverResult<()>;

    /// Moves to the next page. False when already on the last one.
    async fn next_page(&self) -> DriverResult<bool>;

    async fn close(&self) -> DriverResult<()>;

    /// Exact-match lookup among the rows of the current page.
    async fn find_row(&self, key: &str) -> DriverResult<Option<RowHandle>> {
        Ok(self
            .visible_rows()
            .await?
            .into_iter()
            .find(|row| keys_match(&row.key_text, key)))
    }

    /// Bounded wait for a field to become visible. Errors count as "not yet".
    async fn wait_for_field(&self, field: FormField, timeout: Duration, interval: Duration) -> bool {
        await_condition(timeout, interval, move || async move {
            self.field_visible(field).await.unwrap_or(false)
        })
        .await
    }
}

/// Creates fresh driver sessions. One per worker, again on every restart.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self) -> DriverResult<Box<dyn RemoteDriver>>;
}
