// Module: Fake driver
// Scripted in-memory rendition of the remote ERP, shared by the engine tests.
// The backend outlives sessions, so restarts see the same records.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    keys_match, Credentials, Dialog, DialogKind, DriverFactory, ModulePath, RemoteDriver,
    RowHandle, UiAction,
};
use crate::errors::{DriverError, DriverResult};
use crate::protocol::{FormField, PersonType, PERSON_TYPE_GROUP};

/// What the fake does when the save button is clicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveReaction {
    Success,
    Error(String),
    /// Saved, but the toast vanished before anyone saw it.
    Silent,
    /// Not saved; a popup with no error marker is shown.
    Popup(String),
}

#[derive(Debug, Clone)]
struct RemoteRecord {
    key: String,
    person_type: PersonType,
    fields: BTreeMap<FormField, String>,
}

#[derive(Default)]
struct BackendState {
    records: Vec<RemoteRecord>,
    registry: HashMap<String, Vec<(FormField, String)>>,
    registry_delay: u32,
    save_script: VecDeque<SaveReaction>,
    never_ready: HashSet<String>,
    search_dialogs: VecDeque<String>,
    failing_ops: HashMap<String, (DriverError, u32)>,
    create_failures: u32,
    search_inverts_sort: bool,
    page_size: usize,
    sessions_created: u32,
    sessions_closed: u32,
    searches: u32,
    calls: Vec<String>,
    saves: Vec<(String, BTreeMap<FormField, String>)>,
    selects: BTreeMap<String, String>,
}

/// Remote system state shared by every fake session.
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState {
                page_size: 50,
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_record(&self, key: &str, person_type: PersonType, fields: &[(FormField, &str)]) {
        let mut state = self.lock();
        state.records.push(RemoteRecord {
            key: key.to_string(),
            person_type,
            fields: fields.iter().map(|(f, v)| (*f, v.to_string())).collect(),
        });
        state.records.sort_by_key(|r| numeric(&r.key));
    }

    /// Registry lookup fired when this document is typed. Empty values clear the field.
    pub fn register_document(&self, document: &str, overrides: &[(FormField, &str)]) {
        self.lock().registry.insert(
            document.to_string(),
            overrides.iter().map(|(f, v)| (*f, v.to_string())).collect(),
        );
    }

    /// The registry lookup lands only on the `reads`-th field read after the
    /// document is typed.
    pub fn delay_registry(&self, reads: u32) {
        self.lock().registry_delay = reads;
    }

    pub fn script_saves(&self, reactions: Vec<SaveReaction>) {
        self.lock().save_script.extend(reactions);
    }

    pub fn never_ready(&self, key: &str) {
        self.lock().never_ready.insert(key.to_string());
    }

    pub fn make_ready(&self, key: &str) {
        self.lock().never_ready.remove(key);
    }

    /// The next search pops up an error dialog with this text.
    pub fn dialog_on_search(&self, text: &str) {
        self.lock().search_dialogs.push_back(text.to_string());
    }

    /// The next `times` calls of `op` fail with `error`.
    pub fn fail_next(&self, op: &str, error: DriverError, times: u32) {
        self.lock().failing_ops.insert(op.to_string(), (error, times));
    }

    pub fn fail_create(&self, times: u32) {
        self.lock().create_failures = times;
    }

    /// Quick search resets the grid to descending order, like the real grid does.
    pub fn invert_sort_on_search(&self) {
        self.lock().search_inverts_sort = true;
    }

    pub fn set_page_size(&self, size: usize) {
        self.lock().page_size = size.max(1);
    }

    pub fn saved_fields(&self, key: &str) -> Option<BTreeMap<FormField, String>> {
        self.lock()
            .saves
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, fields)| fields.clone())
    }

    pub fn save_count(&self, key: &str) -> usize {
        self.lock().saves.iter().filter(|(k, _)| k == key).count()
    }

    pub fn total_saves(&self) -> usize {
        self.lock().saves.len()
    }

    pub fn searches(&self) -> u32 {
        self.lock().searches
    }

    pub fn sessions_created(&self) -> u32 {
        self.lock().sessions_created
    }

    pub fn sessions_closed(&self) -> u32 {
        self.lock().sessions_closed
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn selected(&self, name: &str) -> Option<String> {
        self.lock().selects.get(name).cloned()
    }
}

fn numeric(key: &str) -> u64 {
    key.chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(u64::MAX)
}

/// Renders keys the way the grid does: thousands separated by dots.
fn display_key(key: &str) -> String {
    if key.len() <= 3 || !key.chars().all(|c| c.is_ascii_digit()) {
        return key.to_string();
    }
    let mut out = String::new();
    for (i, c) in key.chars().enumerate() {
        if i > 0 && (key.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// SESSION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum View {
    Blank,
    Login,
    Home,
    Listing,
    Form(String),
}

struct FormState {
    values: BTreeMap<FormField, String>,
    radios: BTreeMap<String, String>,
    /// Registry lookup still in flight: reads left and values it brings.
    pending_lookup: Option<(u32, Vec<(FormField, String)>)>,
}

struct UiState {
    view: View,
    logged_in: bool,
    search: String,
    ascending: bool,
    page: usize,
    form: Option<FormState>,
    dialog: Option<Dialog>,
    closed: bool,
}

pub struct FakeDriver {
    backend: Arc<FakeBackend>,
    ui: Mutex<UiState>,
}

impl FakeDriver {
    fn ui(&self) -> MutexGuard<'_, UiState> {
        self.ui.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Logs the call and applies scripted failures.
    fn enter(&self, op: &str, detail: &str) -> DriverResult<()> {
        if self.ui().closed {
            return Err(DriverError::SessionClosed);
        }
        let mut state = self.backend.lock();
        state.calls.push(if detail.is_empty() {
            op.to_string()
        } else {
            format!("{} {}", op, detail)
        });
        if let Some((error, remaining)) = state.failing_ops.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        Ok(())
    }

    fn filtered_keys(&self, ui: &UiState) -> Vec<String> {
        let state = self.backend.lock();
        let needle: String = ui.search.chars().filter(|c| c.is_ascii_digit()).collect();
        let mut keys: Vec<String> = state
            .records
            .iter()
            .filter(|r| needle.is_empty() || r.key.contains(&needle))
            .map(|r| r.key.clone())
            .collect();
        if !ui.ascending {
            keys.reverse();
        }
        keys
    }

    fn page_size(&self) -> usize {
        self.backend.lock().page_size
    }

    fn document_visible(ui: &UiState, field: FormField) -> bool {
        let radio = ui
            .form
            .as_ref()
            .and_then(|f| f.radios.get(PERSON_TYPE_GROUP))
            .map(String::as_str);
        match field {
            FormField::Cnpj => radio == Some(PersonType::Organization.radio_value()),
            FormField::Cpf => radio == Some(PersonType::Individual.radio_value()),
            _ => true,
        }
    }
}

#[async_trait]
impl RemoteDriver for FakeDriver {
    async fn navigate_to(&self, url: &str) -> DriverResult<()> {
        self.enter("navigate_to", url)?;
        self.ui().view = View::Login;
        Ok(())
    }

    async fn login(&self, credentials: &Credentials) -> DriverResult<()> {
        self.enter("login", &credentials.user)?;
        let mut ui = self.ui();
        if ui.view != View::Login {
            return Err(DriverError::ElementNotFound("input[placeholder*=\"e-mail\"]".into()));
        }
        ui.logged_in = true;
        ui.view = View::Home;
        Ok(())
    }

    async fn open_module(&self, path: &ModulePath) -> DriverResult<()> {
        self.enter("open_module", &path.item)?;
        let mut ui = self.ui();
        if !ui.logged_in {
            return Err(DriverError::ElementNotFound(path.menu.clone()));
        }
        ui.view = View::Listing;
        Ok(())
    }

    async fn search(&self, key: &str) -> DriverResult<()> {
        self.enter("search", key)?;
        let (inverts, dialog) = {
            let mut state = self.backend.lock();
            state.searches += 1;
            (state.search_inverts_sort, state.search_dialogs.pop_front())
        };
        let mut ui = self.ui();
        if let Some(text) = dialog {
            ui.dialog = Some(Dialog::error(text));
        }
        ui.search = key.to_string();
        ui.page = 0;
        if inverts {
            ui.ascending = false;
        }
        Ok(())
    }

    async fn visible_rows(&self) -> DriverResult<Vec<RowHandle>> {
        self.enter("visible_rows", "")?;
        let ui = self.ui();
        if ui.view != View::Listing {
            return Ok(Vec::new());
        }
        let size = self.page_size();
        Ok(self
            .filtered_keys(&ui)
            .into_iter()
            .skip(ui.page * size)
            .take(size)
            .enumerate()
            .map(|(position, key)| RowHandle {
                position,
                key_text: display_key(&key),
            })
            .collect())
    }

    async fn listing_empty(&self) -> DriverResult<bool> {
        self.enter("listing_empty", "")?;
        let ui = self.ui();
        Ok(ui.view == View::Listing && self.filtered_keys(&ui).is_empty())
    }

    async fn listing_visible(&self) -> DriverResult<bool> {
        Ok(self.ui().view == View::Listing)
    }

    async fn click_edit(&self, row: &RowHandle) -> DriverResult<()> {
        self.enter("click_edit", &row.key_text)?;
        let mut ui = self.ui();
        let size = self.page_size();
        let key = self
            .filtered_keys(&ui)
            .into_iter()
            .skip(ui.page * size)
            .nth(row.position)
            .filter(|k| keys_match(&row.key_text, k))
            .ok_or_else(|| DriverError::ElementNotFound("a#bedit".into()))?;

        let state = self.backend.lock();
        if state.never_ready.contains(&key) {
            return Ok(());
        }
        let record = state
            .records
            .iter()
            .find(|r| r.key == key)
            .ok_or_else(|| DriverError::ElementNotFound(key.clone()))?;
        let mut radios = BTreeMap::new();
        radios.insert(
            PERSON_TYPE_GROUP.to_string(),
            record.person_type.radio_value().to_string(),
        );
        ui.form = Some(FormState {
            values: record.fields.clone(),
            radios,
            pending_lookup: None,
        });
        ui.view = View::Form(key);
        Ok(())
    }

    async fn field_visible(&self, field: FormField) -> DriverResult<bool> {
        let ui = self.ui();
        if ui.closed {
            return Err(DriverError::SessionClosed);
        }
        Ok(matches!(ui.view, View::Form(_)) && Self::document_visible(&ui, field))
    }

    async fn read_field(&self, field: FormField) -> DriverResult<String> {
        self.enter("read_field", field.remote_id())?;
        let mut ui = self.ui();
        if !matches!(ui.view, View::Form(_)) {
            return Err(DriverError::ElementNotFound(field.remote_id().into()));
        }
        let form = ui
            .form
            .as_mut()
            .ok_or_else(|| DriverError::ElementNotFound(field.remote_id().into()))?;
        let landed = match form.pending_lookup.as_mut() {
            Some((reads, _)) => {
                *reads = reads.saturating_sub(1);
                *reads == 0
            }
            None => false,
        };
        if landed {
            if let Some((_, overrides)) = form.pending_lookup.take() {
                form.values.extend(overrides);
            }
        }
        Ok(form.values.get(&field).cloned().unwrap_or_default())
    }

    async fn set_field(&self, field: FormField, value: &str) -> DriverResult<()> {
        self.enter("set_field", &format!("{}={}", field.remote_id(), value))?;
        let mut ui = self.ui();
        if !Self::document_visible(&ui, field) {
            return Err(DriverError::ElementNotFound(field.remote_id().into()));
        }
        let form = ui
            .form
            .as_mut()
            .ok_or_else(|| DriverError::ElementNotFound(field.remote_id().into()))?;
        form.values.insert(field, value.to_string());

        if field.is_document() {
            let state = self.backend.lock();
            if let Some(overrides) = state.registry.get(value) {
                if state.registry_delay > 0 {
                    form.pending_lookup = Some((state.registry_delay, overrides.clone()));
                } else {
                    form.values.extend(overrides.iter().cloned());
                }
            }
        }
        Ok(())
    }

    async fn set_radio(&self, group: &str, value: &str) -> DriverResult<()> {
        self.enter("set_radio", &format!("{}={}", group, value))?;
        let mut ui = self.ui();
        let form = ui
            .form
            .as_mut()
            .ok_or_else(|| DriverError::ElementNotFound(group.into()))?;
        form.radios.insert(group.to_string(), value.to_string());
        Ok(())
    }

    async fn set_select(&self, name: &str, value: &str) -> DriverResult<()> {
        self.enter("set_select", &format!("{}={}", name, value))?;
        self.backend
            .lock()
            .selects
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn click(&self, action: UiAction) -> DriverResult<()> {
        self.enter("click", &format!("{:?}", action))?;
        let mut ui = self.ui();
        let key = match &ui.view {
            View::Form(key) => key.clone(),
            _ => return Err(DriverError::ElementNotFound(format!("{:?}", action))),
        };

        match action {
            UiAction::Back => {
                ui.view = View::Listing;
                ui.form = None;
            }
            UiAction::Save => {
                let mut state = self.backend.lock();
                let reaction = state.save_script.pop_front().unwrap_or(SaveReaction::Success);
                match &reaction {
                    SaveReaction::Error(text) => {
                        ui.dialog = Some(Dialog::error(text.clone()));
                        return Ok(());
                    }
                    SaveReaction::Popup(text) => {
                        ui.dialog = Some(Dialog {
                            kind: DialogKind::Confirm,
                            text: text.clone(),
                        });
                        return Ok(());
                    }
                    SaveReaction::Success | SaveReaction::Silent => {}
                }
                let form = ui
                    .form
                    .as_ref()
                    .ok_or_else(|| DriverError::ElementNotFound("#sc_b_upd_t".into()))?;
                let person_type = if form.radios.get(PERSON_TYPE_GROUP).map(String::as_str)
                    == Some(PersonType::Individual.radio_value())
                {
                    PersonType::Individual
                } else {
                    PersonType::Organization
                };
                let values = form.values.clone();
                if let Some(record) = state.records.iter_mut().find(|r| r.key == key) {
                    record.fields = values.clone();
                    record.person_type = person_type;
                }
                state.saves.push((key, values));
                drop(state);
                if reaction == SaveReaction::Success {
                    ui.dialog = Some(Dialog::success("Registro atualizado com sucesso"));
                }
            }
        }
        Ok(())
    }

    async fn detect_dialog(&self) -> DriverResult<Option<Dialog>> {
        self.enter("detect_dialog", "")?;
        let mut ui = self.ui();
        // Toasts vanish on their own once shown.
        if ui.dialog.as_ref().map(|d| d.kind) == Some(DialogKind::Success) {
            return Ok(ui.dialog.take());
        }
        Ok(ui.dialog.clone())
    }

    async fn dismiss_dialog(&self) -> DriverResult<bool> {
        self.enter("dismiss_dialog", "")?;
        Ok(self.ui().dialog.take().is_some())
    }

    async fn sort_ascending_by(&self, column: &str) -> DriverResult<()> {
        self.enter("sort_ascending_by", column)?;
        self.ui().ascending = true;
        Ok(())
    }

    async fn first_page(&self) -> DriverResult<()> {
        self.enter("first_page", "")?;
        self.ui().page = 0;
        Ok(())
    }

    async fn next_page(&self) -> DriverResult<bool> {
        self.enter("next_page", "")?;
        let mut ui = self.ui();
        let size = self.page_size();
        let total = self.filtered_keys(&ui).len();
        if (ui.page + 1) * size < total {
            ui.page += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn close(&self) -> DriverResult<()> {
        self.enter("close", "")?;
        self.ui().closed = true;
        self.backend.lock().sessions_closed += 1;
        Ok(())
    }
}

/// Factory handing out fake sessions over one shared backend.
pub struct FakeFactory {
    backend: Arc<FakeBackend>,
}

impl FakeFactory {
    pub fn new(backend: Arc<FakeBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl DriverFactory for FakeFactory {
    async fn create(&self) -> DriverResult<Box<dyn RemoteDriver>> {
        {
            let mut state = self.backend.lock();
            if state.create_failures > 0 {
                state.create_failures -= 1;
                return Err(DriverError::WebDriver("connection refused".into()));
            }
            state.sessions_created += 1;
        }
        Ok(Box::new(FakeDriver {
            backend: Arc::clone(&self.backend),
            ui: Mutex::new(UiState {
                view: View::Blank,
                logged_in: false,
                search: String::new(),
                ascending: true,
                page: 0,
                form: None,
                dialog: None,
                closed: false,
            }),
        }))
    }
}

/// Session already logged in and sitting on the records listing.
pub async fn listing_session(backend: &Arc<FakeBackend>) -> Box<dyn RemoteDriver> {
    let driver = FakeFactory::new(Arc::clone(backend))
        .create()
        .await
        .expect("fake session");
    driver.navigate_to("http://erp.local/login").await.expect("navigate");
    driver.login(&Credentials::default()).await.expect("login");
    driver
        .open_module(&ModulePath {
            menu: "Cadastros".into(),
            item: "Cliente/Fornecedores".into(),
        })
        .await
        .expect("open module");
    driver
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_key_groups_thousands() {
        assert_eq!(display_key("42"), "42");
        assert_eq!(display_key("1234"), "1.234");
        assert_eq!(display_key("1234567"), "1.234.567");
    }

    #[tokio::test]
    async fn test_registry_applies_on_document_write() {
        let backend = FakeBackend::new();
        backend.add_record("7", PersonType::Organization, &[(FormField::Street, "Rua A")]);
        backend.register_document("12345678000195", &[(FormField::Street, "Rua B")]);
        let driver = listing_session(&backend).await;

        driver.search("7").await.unwrap();
        let row = driver.find_row("7").await.unwrap().unwrap();
        driver.click_edit(&row).await.unwrap();

        assert_eq!(driver.read_field(FormField::Street).await.unwrap(), "Rua A");
        driver.set_field(FormField::Cnpj, "12345678000195").await.unwrap();
        assert_eq!(driver.read_field(FormField::Street).await.unwrap(), "Rua B");
        assert!(driver.set_field(FormField::Cpf, "1").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_session_reports_session_closed() {
        let backend = FakeBackend::new();
        let driver = FakeFactory::new(Arc::clone(&backend)).create().await.unwrap();
        driver.close().await.unwrap();

        assert_eq!(driver.search("1").await, Err(DriverError::SessionClosed));
        assert_eq!(backend.sessions_closed(), 1);
    }
}
