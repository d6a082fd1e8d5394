// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory content provider for testing.
//!
//! This module provides `MemoryProvider`, a [`ContentProvider`] that serves songs and setlists
//! from memory, records every call and supports failure injection for testing error paths.
//! [`advance_until_complete`] runs code that waits on a [`ClockControl`]-backed clock.

use std::fmt::{self, Debug, Formatter};
use std::pin::pin;
use std::task::Poll;
use std::time::Duration;

use parking_lot::Mutex;
use tick::{Clock, ClockControl};

use crate::{ContentProvider, Item, ProviderError, SONG_DOCUMENT_NAME};

/// Recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    /// Song folders were listed.
    ListSongFolders,
    /// The song document of the given folder was looked up.
    FindSongDocument(Item),
    /// The given document was read.
    ReadDocument(Item),
    /// Setlist files were listed.
    ListSetlistFiles,
    /// The sheet titles of the given file were listed.
    SheetTitles(Item),
    /// A sheet was read.
    ReadSheet {
        /// The spreadsheet.
        file: Item,
        /// The sheet title.
        sheet: String,
    },
}

type FailRule = Box<dyn FnMut(&ProviderCall) -> Option<ProviderError> + Send>;

#[derive(Debug, Clone)]
struct SongFolder {
    folder: Item,
    document: Option<(Item, String)>,
}

#[derive(Debug, Clone)]
struct SetlistFile {
    file: Item,
    sheets: Vec<(String, Vec<Vec<String>>)>,
}

#[derive(Default)]
struct State {
    songs: Vec<SongFolder>,
    setlists: Vec<SetlistFile>,
    calls: Vec<ProviderCall>,
    fail: Option<FailRule>,
    latency: Option<(Clock, Duration)>,
}

/// A [`ContentProvider`] serving songs and setlists from memory.
///
/// All calls are recorded for later verification. A failure rule installed with
/// [`MemoryProvider::fail_with`] or [`MemoryProvider::fail_when`] is consulted before every call
/// and can make it fail.
///
/// # Examples
///
/// ```
/// use encore::testing::{MemoryProvider, ProviderCall};
/// use encore::{ContentProvider, ProviderError};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let provider = MemoryProvider::new();
/// provider.add_song("let_it_be", "# Let It Be");
/// provider.fail_when(|call| matches!(call, ProviderCall::ReadDocument(_)), ProviderError::new("boom"));
///
/// let folders = provider.list_song_folders().await.unwrap();
/// assert_eq!(folders[0].name, "let_it_be");
/// assert_eq!(provider.calls(), [ProviderCall::ListSongFolders]);
/// # }
/// ```
pub struct MemoryProvider {
    state: Mutex<State>,
}

impl Debug for MemoryProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryProvider")
            .field("songs", &state.songs.len())
            .field("setlists", &state.setlists.len())
            .field("calls", &state.calls.len())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Adds a song folder named `folder` whose song document holds `content`.
    pub fn add_song(&self, folder: &str, content: impl Into<String>) {
        self.state.lock().songs.push(SongFolder {
            folder: Item::new(format!("folder:{folder}"), folder),
            document: Some((Item::new(format!("doc:{folder}"), SONG_DOCUMENT_NAME), content.into())),
        });
    }

    /// Adds a song folder named `folder` without a song document.
    pub fn add_empty_folder(&self, folder: &str) {
        self.state.lock().songs.push(SongFolder {
            folder: Item::new(format!("folder:{folder}"), folder),
            document: None,
        });
    }

    /// Adds a spreadsheet named `file` with the given sheets, each a title and its rows.
    pub fn add_setlist<S, R, C>(&self, file: &str, sheets: impl IntoIterator<Item = (S, R)>)
    where
        S: Into<String>,
        R: IntoIterator<Item = Vec<C>>,
        C: Into<String>,
    {
        let sheets = sheets
            .into_iter()
            .map(|(title, rows)| {
                let rows = rows.into_iter().map(|row| row.into_iter().map(Into::into).collect()).collect();
                (title.into(), rows)
            })
            .collect();

        self.state.lock().setlists.push(SetlistFile {
            file: Item::new(format!("sheet:{file}"), file),
            sheets,
        });
    }

    /// Makes every call go through `rule`; a call fails with the error `rule` returns, if any.
    pub fn fail_with(&self, rule: impl FnMut(&ProviderCall) -> Option<ProviderError> + Send + 'static) {
        self.state.lock().fail = Some(Box::new(rule));
    }

    /// Makes every call matching `predicate` fail with `error`.
    pub fn fail_when(&self, predicate: impl Fn(&ProviderCall) -> bool + Send + 'static, error: ProviderError) {
        self.fail_with(move |call| predicate(call).then(|| error.clone()));
    }

    /// Removes the failure rule.
    pub fn clear_failures(&self) {
        self.state.lock().fail = None;
    }

    /// Makes every call take `latency`, measured on `clock`, before answering.
    pub fn set_latency(&self, clock: &Clock, latency: Duration) {
        self.state.lock().latency = Some((clock.clone(), latency));
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().calls.clone()
    }

    /// How many calls were made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    async fn call<T>(&self, call: ProviderCall, answer: impl FnOnce(&State) -> T) -> Result<T, ProviderError> {
        let latency = self.state.lock().latency.clone();
        if let Some((clock, latency)) = latency {
            clock.delay(latency).await;
        }

        let mut state = self.state.lock();
        let failure = state.fail.as_mut().and_then(|rule| rule(&call));
        state.calls.push(call);

        match failure {
            Some(error) => Err(error),
            None => Ok(answer(&state)),
        }
    }
}

/// How often [`settle`] yields to the runtime.
const SETTLE_YIELDS: usize = 16;

/// Lets every runnable task on the current runtime make progress.
pub async fn settle() {
    for _ in 0..SETTLE_YIELDS {
        tokio::task::yield_now().await;
    }
}

/// Drives `future` to completion, moving `control` forward by `step` whenever it is stuck.
///
/// Before each step, other tasks get a chance to run so that spawned work registers its timers.
/// Delays, backoffs and timeouts on clocks created from `control` therefore complete without
/// real time passing. Durations that are a multiple of `step` elapse exactly.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use encore::testing::advance_until_complete;
/// use tick::ClockControl;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let control = ClockControl::new();
/// let clock = control.to_clock();
/// let stopwatch = clock.stopwatch();
///
/// advance_until_complete(&control, Duration::from_secs(1), clock.delay(Duration::from_secs(90))).await;
///
/// assert_eq!(stopwatch.elapsed(), Duration::from_secs(90));
/// # }
/// ```
pub async fn advance_until_complete<F: Future>(control: &ClockControl, step: Duration, future: F) -> F::Output {
    let mut future = pin!(future);
    loop {
        if let Poll::Ready(output) = futures::poll!(future.as_mut()) {
            return output;
        }
        settle().await;
        if let Poll::Ready(output) = futures::poll!(future.as_mut()) {
            return output;
        }
        control.advance(step);
    }
}

impl ContentProvider for MemoryProvider {
    async fn list_song_folders(&self) -> Result<Vec<Item>, ProviderError> {
        self.call(ProviderCall::ListSongFolders, |state| {
            state.songs.iter().map(|song| song.folder.clone()).collect()
        })
        .await
    }

    async fn find_song_document(&self, folder: &Item) -> Result<Option<Item>, ProviderError> {
        self.call(ProviderCall::FindSongDocument(folder.clone()), |state| {
            state
                .songs
                .iter()
                .find(|song| song.folder == *folder)
                .and_then(|song| song.document.as_ref().map(|(document, _)| document.clone()))
        })
        .await
    }

    async fn read_document(&self, document: &Item) -> Result<String, ProviderError> {
        let content = self
            .call(ProviderCall::ReadDocument(document.clone()), |state| {
                state
                    .songs
                    .iter()
                    .filter_map(|song| song.document.as_ref())
                    .find(|(item, _)| item == document)
                    .map(|(_, content)| content.clone())
            })
            .await?;

        content.ok_or_else(|| ProviderError::new(format!("document {} not found", document.id)))
    }

    async fn list_setlist_files(&self) -> Result<Vec<Item>, ProviderError> {
        self.call(ProviderCall::ListSetlistFiles, |state| {
            state.setlists.iter().map(|setlist| setlist.file.clone()).collect()
        })
        .await
    }

    async fn sheet_titles(&self, file: &Item) -> Result<Vec<String>, ProviderError> {
        let titles = self
            .call(ProviderCall::SheetTitles(file.clone()), |state| {
                state
                    .setlists
                    .iter()
                    .find(|setlist| setlist.file == *file)
                    .map(|setlist| setlist.sheets.iter().map(|(title, _)| title.clone()).collect::<Vec<_>>())
            })
            .await?;

        titles.ok_or_else(|| ProviderError::new(format!("spreadsheet {} not found", file.id)))
    }

    async fn read_sheet(&self, file: &Item, sheet: &str) -> Result<Vec<Vec<String>>, ProviderError> {
        let call = ProviderCall::ReadSheet {
            file: file.clone(),
            sheet: sheet.to_string(),
        };
        let rows = self
            .call(call, |state| {
                state
                    .setlists
                    .iter()
                    .find(|setlist| setlist.file == *file)
                    .and_then(|setlist| setlist.sheets.iter().find(|(title, _)| title == sheet))
                    .map(|(_, rows)| rows.clone())
            })
            .await?;

        rows.ok_or_else(|| ProviderError::new(format!("sheet {sheet} not found in {}", file.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_added_content() {
        let provider = MemoryProvider::new();
        provider.add_song("yesterday", "# Yesterday");
        provider.add_empty_folder("drafts");
        provider.add_setlist("Gig", [("Sheet1", vec![vec!["Yesterday"]])]);

        let folders = provider.list_song_folders().await.expect("listing succeeds");
        assert_eq!(folders.len(), 2);

        let document = provider.find_song_document(&folders[0]).await.expect("lookup succeeds");
        let document = document.expect("yesterday has a document");
        assert_eq!(document.name, SONG_DOCUMENT_NAME);
        assert_eq!(provider.read_document(&document).await.expect("read succeeds"), "# Yesterday");
        assert_eq!(provider.find_song_document(&folders[1]).await.expect("lookup succeeds"), None);

        let files = provider.list_setlist_files().await.expect("listing succeeds");
        assert_eq!(provider.sheet_titles(&files[0]).await.expect("titles"), ["Sheet1"]);
        assert_eq!(provider.read_sheet(&files[0], "Sheet1").await.expect("rows"), [vec!["Yesterday".to_string()]]);
        assert!(provider.read_sheet(&files[0], "Missing").await.is_err());
        assert_eq!(provider.call_count(), 8);
    }

    #[tokio::test]
    async fn failure_rule_is_consulted_per_call() {
        let provider = MemoryProvider::new();
        let mut remaining = 1;
        provider.fail_with(move |_| {
            if remaining > 0 {
                remaining -= 1;
                Some(ProviderError::new("rate limit exceeded"))
            } else {
                None
            }
        });

        assert!(provider.list_song_folders().await.is_err());
        assert!(provider.list_song_folders().await.is_ok());

        provider.fail_when(|call| matches!(call, ProviderCall::ListSetlistFiles), ProviderError::new("boom"));
        assert!(provider.list_song_folders().await.is_ok());
        assert!(provider.list_setlist_files().await.is_err());

        provider.clear_failures();
        assert!(provider.list_setlist_files().await.is_ok());
        assert_eq!(provider.calls().len(), 5);
    }

    #[tokio::test]
    async fn latency_elapses_on_controlled_clock() {
        let control = ClockControl::new();
        let clock = control.to_clock();
        let provider = MemoryProvider::new();
        provider.add_song("yesterday", "# Yesterday");
        provider.set_latency(&clock, Duration::from_secs(3));
        let stopwatch = clock.stopwatch();

        let folders = advance_until_complete(&control, Duration::from_secs(1), provider.list_song_folders())
            .await
            .expect("listing succeeds");

        assert_eq!(folders.len(), 1);
        assert_eq!(stopwatch.elapsed(), Duration::from_secs(3));
    }
}
