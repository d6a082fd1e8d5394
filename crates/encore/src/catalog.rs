// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Aggregation of songs and setlists from a content provider.
//!
//! Songs live in folders, one folder per song, each holding a [`SONG_DOCUMENT_NAME`] document.
//! Setlists are spreadsheets: every non-blank cell of a sheet names a song, in row order.

use std::collections::BTreeMap;

use crate::{Aggregate, DataAggregator, Payload, ProviderError, Result, RetryExecutor, Setlist, SetlistId, Song, SongId};

/// Name of the document holding a song inside its folder.
pub const SONG_DOCUMENT_NAME: &str = "README.md";

/// A folder, document or spreadsheet known to the content provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Item {
    /// Provider-specific identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl Item {
    /// Creates an item.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl Payload for Item {}

/// The remote store holding songs and setlists.
///
/// Every method performs exactly one upstream call. [`CatalogAggregator`] runs each of them through
/// a [`RetryExecutor`], so implementations should neither retry nor throttle on their own.
pub trait ContentProvider: Send + Sync + 'static {
    /// Lists the folders holding songs.
    fn list_song_folders(&self) -> impl Future<Output = std::result::Result<Vec<Item>, ProviderError>> + Send;

    /// Looks up the [`SONG_DOCUMENT_NAME`] document inside `folder`.
    fn find_song_document(&self, folder: &Item) -> impl Future<Output = std::result::Result<Option<Item>, ProviderError>> + Send;

    /// Reads the text of `document`.
    fn read_document(&self, document: &Item) -> impl Future<Output = std::result::Result<String, ProviderError>> + Send;

    /// Lists the spreadsheets holding setlists.
    fn list_setlist_files(&self) -> impl Future<Output = std::result::Result<Vec<Item>, ProviderError>> + Send;

    /// Lists the sheet titles of `file`.
    fn sheet_titles(&self, file: &Item) -> impl Future<Output = std::result::Result<Vec<String>, ProviderError>> + Send;

    /// Reads the cells of `sheet` in `file`, row by row.
    fn read_sheet(&self, file: &Item, sheet: &str) -> impl Future<Output = std::result::Result<Vec<Vec<String>>, ProviderError>> + Send;
}

/// A [`DataAggregator`] that reads songs and setlists from a [`ContentProvider`].
///
/// Listing song folders or setlist files must succeed; the aggregation fails otherwise. A single
/// song folder, spreadsheet or sheet that cannot be read is skipped and logged, and the remaining
/// items are still aggregated. Songs and setlists are fetched concurrently.
#[derive(Debug)]
pub struct CatalogAggregator<P> {
    provider: P,
    executor: RetryExecutor,
}

impl<P: ContentProvider> CatalogAggregator<P> {
    /// Creates an aggregator issuing every call to `provider` through `executor`.
    #[must_use]
    pub fn new(provider: P, executor: RetryExecutor) -> Self {
        Self { provider, executor }
    }

    /// The content provider.
    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The executor upstream calls go through.
    #[must_use]
    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// Fetches every song, keyed by folder name.
    ///
    /// # Errors
    ///
    /// Returns an error if the song folders cannot be listed.
    pub async fn fetch_songs(&self) -> Result<BTreeMap<SongId, Song>> {
        let folders = self.executor.execute(|| self.provider.list_song_folders()).await?;
        let mut songs = BTreeMap::new();

        for folder in &folders {
            match self.fetch_song(folder).await {
                Ok(Some(song)) => {
                    songs.insert(folder.name.clone(), song);
                }
                Ok(None) => tracing::event!(
                    name: "encore.catalog.song_missing",
                    tracing::Level::WARN,
                    catalog.folder = %folder.name,
                    "no {SONG_DOCUMENT_NAME} in song folder",
                ),
                Err(error) => tracing::event!(
                    name: "encore.catalog.song_failed",
                    tracing::Level::ERROR,
                    catalog.folder = %folder.name,
                    error = %error,
                ),
            }
        }

        Ok(songs)
    }

    async fn fetch_song(&self, folder: &Item) -> Result<Option<Song>> {
        let Some(document) = self.executor.execute(|| self.provider.find_song_document(folder)).await? else {
            return Ok(None);
        };
        let content = self.executor.execute(|| self.provider.read_document(&document)).await?;

        Ok(Some(Song {
            title: title_from_folder_name(&folder.name),
            content,
        }))
    }

    /// Fetches every setlist, keyed by setlist name.
    ///
    /// # Errors
    ///
    /// Returns an error if the setlist files cannot be listed.
    pub async fn fetch_setlists(&self) -> Result<BTreeMap<SetlistId, Setlist>> {
        let files = self.executor.execute(|| self.provider.list_setlist_files()).await?;
        let mut setlists = BTreeMap::new();

        for file in &files {
            let sheets = match self.executor.execute(|| self.provider.sheet_titles(file)).await {
                Ok(sheets) => sheets,
                Err(error) => {
                    tracing::event!(
                        name: "encore.catalog.setlist_failed",
                        tracing::Level::ERROR,
                        catalog.file = %file.name,
                        error = %error,
                    );
                    continue;
                }
            };

            for sheet in &sheets {
                let rows = match self.executor.execute(|| self.provider.read_sheet(file, sheet)).await {
                    Ok(rows) => rows,
                    Err(error) => {
                        tracing::event!(
                            name: "encore.catalog.sheet_failed",
                            tracing::Level::ERROR,
                            catalog.file = %file.name,
                            catalog.sheet = %sheet,
                            error = %error,
                        );
                        continue;
                    }
                };

                if rows.is_empty() {
                    continue;
                }

                let name = setlist_name(&file.name, sheet, sheets.len());
                let setlist = Setlist {
                    name: name.clone(),
                    songs: songs_from_rows(rows),
                };
                setlists.insert(name, setlist);
            }
        }

        Ok(setlists)
    }
}

impl<P: ContentProvider> DataAggregator for CatalogAggregator<P> {
    async fn fetch_aggregate(&self) -> Result<Aggregate> {
        let (songs, setlists) = futures::try_join!(self.fetch_songs(), self.fetch_setlists())?;
        Ok(Aggregate { songs, setlists })
    }
}

/// Turns a `snake_case` folder name into a Title Case song title.
///
/// # Examples
///
/// ```
/// use encore::title_from_folder_name;
///
/// assert_eq!(title_from_folder_name("hotel_california"), "Hotel California");
/// assert_eq!(title_from_folder_name("ABBA_medley"), "Abba Medley");
/// ```
#[must_use]
pub fn title_from_folder_name(name: &str) -> String {
    let title = name
        .split('_')
        .filter(|word| !word.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ");

    if title.is_empty() { name.to_string() } else { title }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
    })
}

fn setlist_name(file: &str, sheet: &str, sheet_count: usize) -> String {
    if sheet_count == 1 { file.to_string() } else { format!("{file} - {sheet}") }
}

fn songs_from_rows(rows: Vec<Vec<String>>) -> Vec<String> {
    rows.into_iter()
        .flatten()
        .map(|cell| cell.trim().to_string())
        .filter(|cell| !cell.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles() {
        assert_eq!(title_from_folder_name("wonderwall"), "Wonderwall");
        assert_eq!(title_from_folder_name("dont_stop_me_now"), "Dont Stop Me Now");
        assert_eq!(title_from_folder_name("__double__underscore"), "Double Underscore");
        assert_eq!(title_from_folder_name("___"), "___");
        assert_eq!(title_from_folder_name("élan_vital"), "Élan Vital");
    }

    #[test]
    fn setlist_names() {
        assert_eq!(setlist_name("Gig", "Sheet1", 1), "Gig");
        assert_eq!(setlist_name("Gig", "Encore", 2), "Gig - Encore");
    }

    #[test]
    fn songs_are_trimmed_non_blank_cells_in_row_order() {
        let rows = vec![
            vec![" Intro ".to_string(), String::new()],
            vec!["   ".to_string()],
            vec!["Wonderwall".to_string(), "Hey Jude".to_string()],
        ];

        assert_eq!(songs_from_rows(rows), ["Intro", "Wonderwall", "Hey Jude"]);
    }
}
