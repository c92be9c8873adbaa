// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, PasswordDisplayMode};
use log::warn;
use polars::prelude::DataFrame;
use std::path::PathBuf;
use tokio::sync::mpsc;
use zegami_client::{
    BatchOptions, Client, Collection, DEFAULT_SIGNED_EXPIRY_DAYS, Error, FilterValue, Progress,
    RowFilter, SourceRef, UploadableSource, UrlOptions, Workspace, parse_rows,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Zegami deployment URL
    #[clap(long, env = "ZEGAMI_HOME")]
    home: Option<String>,

    /// Zegami Username
    #[clap(long, env = "ZEGAMI_USERNAME")]
    username: Option<String>,

    /// Zegami Password
    #[clap(long, env = "ZEGAMI_PASSWORD")]
    password: Option<String>,

    /// Zegami Token
    #[clap(long, env = "ZEGAMI_TOKEN")]
    token: Option<String>,

    /// Client Command
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Login with the provided username and password, prompting for what is
    /// missing.  The token is stored in the per-host token file.
    Login,
    /// Logout by removing the token from the per-host token file.
    Logout,
    /// Print the current authentication token.
    Token,
    /// Show the authenticated user and their workspaces.
    Workspaces,
    /// List the collections of a workspace.
    Collections {
        /// Workspace name or ID
        workspace: String,

        /// Filter collections by name
        #[clap(long)]
        name: Option<String>,
    },
    /// List the image sources of a collection.
    Sources {
        /// Workspace name or ID
        workspace: String,
        /// Collection name or ID
        collection: String,
    },
    /// Print the rows of a collection, optionally filtered.
    Rows {
        /// Workspace name or ID
        workspace: String,
        /// Collection name or ID
        collection: String,

        /// Keep rows whose column holds one of the values, as
        /// `column=value1,value2`.  Repeat for more columns.  Quote a value
        /// (`'007'`) to match it as text rather than a number.
        #[clap(long = "filter")]
        filters: Vec<String>,

        /// Keep rows carrying any of the tags.  Ignored with --filter.
        #[clap(long = "tag")]
        tags: Vec<String>,
    },
    /// List the tags of a collection with their row counts.
    Tags {
        /// Workspace name or ID
        workspace: String,
        /// Collection name or ID
        collection: String,
    },
    /// Print one image URL per row.
    Urls {
        /// Workspace name or ID
        workspace: String,
        /// Collection name or ID
        collection: String,
        /// Row indices
        #[clap(required = true)]
        rows: Vec<usize>,

        /// Source name, defaults to the first source
        #[clap(long)]
        source: Option<String>,

        /// Request signed URLs
        #[clap(long)]
        signed: bool,

        /// Validity of signed URLs in days
        #[clap(long, default_value_t = DEFAULT_SIGNED_EXPIRY_DAYS)]
        expiry_days: u32,
    },
    /// Download the images of the given rows.
    Download {
        /// Workspace name or ID
        workspace: String,
        /// Collection name or ID
        collection: String,
        /// Row indices
        #[clap(required = true)]
        rows: Vec<usize>,

        /// Source name, defaults to the first source
        #[clap(long)]
        source: Option<String>,

        /// Output directory, defaults to the current directory
        #[clap(long)]
        output: Option<PathBuf>,
    },
    /// Upload image files or directories into a source of a collection.
    UploadImages {
        /// Workspace name or ID
        workspace: String,
        /// Collection name or ID
        collection: String,
        /// Source name, `default` for single source collections
        source: String,
        /// Image files and directories
        #[clap(required = true)]
        paths: Vec<PathBuf>,

        /// Row data (TSV or spreadsheet) replacing the collection data once
        /// the images are uploaded
        #[clap(long)]
        data: Option<PathBuf>,

        /// Column of the row data naming the image files
        #[clap(long, default_value = "Filename")]
        column: String,
    },
    /// Replace the row data of a collection with a TSV, CSV or XLSX file.
    ReplaceData {
        /// Workspace name or ID
        workspace: String,
        /// Collection name or ID
        collection: String,
        /// Data file
        file: PathBuf,

        /// Replace the data even when the collection is still processing
        #[clap(long)]
        force: bool,
    },
    /// List the annotations of a source.
    Annotations {
        /// Workspace name or ID
        workspace: String,
        /// Collection name or ID
        collection: String,

        /// Source name, defaults to the first source
        #[clap(long)]
        source: Option<String>,
    },
    /// Delete an annotation.
    DeleteAnnotation {
        /// Workspace name or ID
        workspace: String,
        /// Collection name or ID
        collection: String,
        /// Annotation ID
        annotation_id: String,
    },
}

fn source_ref(source: Option<String>) -> SourceRef {
    source.map(SourceRef::from).unwrap_or_default()
}

/// Parses `column=value1,value2` into a column name and its allowed values.
fn parse_filter(text: &str) -> Result<(String, Vec<FilterValue>), Error> {
    let (column, values) = text.split_once('=').ok_or_else(|| {
        Error::InvalidParameters(format!(
            "filter '{}' should look like column=value1,value2",
            text
        ))
    })?;
    if column.is_empty() {
        return Err(Error::InvalidParameters(format!(
            "filter '{}' has no column name",
            text
        )));
    }
    let values = values.split(',').map(FilterValue::parse).collect();
    Ok((column.to_string(), values))
}

/// Progress bar fed from the returned channel until every sender is dropped.
fn progress_bar(message: &'static str) -> mpsc::Sender<Progress> {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise} ETA: {eta}] {msg}: {wide_bar:.yellow} {human_pos}/{human_len}",
    ) {
        bar.set_style(style.progress_chars("█▇▆▅▄▃▂▁  "));
    }
    bar.set_message(message);

    let (tx, mut rx) = mpsc::channel::<Progress>(1);
    tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            if progress.total > 0 {
                bar.set_length(progress.total as u64);
                bar.set_position(progress.current as u64);
            }
        }
        bar.finish();
    });
    tx
}

fn prompt(message: &str, mode: PasswordDisplayMode) -> Result<String, Error> {
    Password::new(message)
        .with_display_mode(mode)
        .without_confirmation()
        .prompt()
        .map_err(|e| Error::InvalidParameters(format!("{}: {}", message, e)))
}

async fn find_workspace(client: &Client, workspace: &str) -> Result<Workspace, Error> {
    match client.workspace_by_id(workspace).await {
        Err(Error::NotFound(_)) => client.workspace_by_name(workspace).await,
        result => result,
    }
}

async fn find_collection(
    client: &Client,
    workspace: &str,
    collection: &str,
) -> Result<Collection, Error> {
    let workspace = find_workspace(client, workspace).await?;
    match workspace.get_collection_by_name(collection).await {
        Err(Error::NotFound(_)) => workspace.get_collection_by_id(collection).await,
        result => result,
    }
}

async fn handle_login(
    client: Client,
    username: Option<String>,
    password: Option<String>,
) -> Result<(), Error> {
    let username = match username {
        Some(username) => username,
        None => prompt("Zegami Username", PasswordDisplayMode::Full)?,
    };
    let password = match password {
        Some(password) => password,
        None => prompt("Zegami Password", PasswordDisplayMode::Masked)?,
    };

    let client = client.with_login(&username, &password).await?;
    client.save_token().await?;

    let user = client.user_info().await?;
    println!("Successfully logged into {} as {}", client.url(), user.email());
    Ok(())
}

async fn handle_logout(client: &Client) -> Result<(), Error> {
    client.logout().await?;
    println!("Successfully logged out of {}", client.url());
    Ok(())
}

async fn handle_token(client: &Client) -> Result<(), Error> {
    println!("{}", client.token().await);
    Ok(())
}

async fn handle_workspaces(client: &Client) -> Result<(), Error> {
    let user = client.user_info().await?;
    println!("User: {} <{}>", user.name(), user.email());
    for (id, name) in user.workspaces() {
        println!("[{}] {}", id, name);
    }
    Ok(())
}

async fn handle_collections(
    client: &Client,
    workspace: String,
    name: Option<String>,
) -> Result<(), Error> {
    let workspace = find_workspace(client, &workspace).await?;
    let collections = match name {
        Some(name) => workspace.find_collections(&name).await?,
        None => workspace.collections().await?,
    };
    for collection in collections {
        println!(
            "[{}] {} v{} ({} rows, {}): {}",
            collection.id(),
            collection.name(),
            collection.version(),
            collection.len(),
            collection.status(),
            collection.description()
        );
    }
    Ok(())
}

async fn handle_sources(client: &Client, workspace: String, collection: String) -> Result<(), Error> {
    let collection = find_collection(client, &workspace, &collection).await?;
    for source in collection.sources() {
        println!("{}", source);
    }
    Ok(())
}

async fn handle_rows(
    client: &Client,
    workspace: String,
    collection: String,
    filters: Vec<String>,
    tags: Vec<String>,
) -> Result<(), Error> {
    let collection = find_collection(client, &workspace, &collection).await?;

    let rows: DataFrame = if !filters.is_empty() {
        let mut filter = RowFilter::new();
        for text in &filters {
            let (column, values) = parse_filter(text)?;
            filter = filter.column(&column, values);
        }
        collection.get_rows_by_filter(&filter).await?.into_frame()
    } else if !tags.is_empty() {
        collection.get_rows_by_tags(&tags[..]).await?.into_frame()
    } else {
        collection.rows().await?
    };

    println!("{}", rows);
    Ok(())
}

async fn handle_tags(client: &Client, workspace: String, collection: String) -> Result<(), Error> {
    let collection = find_collection(client, &workspace, &collection).await?;
    let tags = collection.tags().await?;
    let mut names = tags.names().collect::<Vec<_>>();
    names.sort_unstable();
    for name in names {
        println!("{}: {}", name, tags.get(name).map_or(0, <[usize]>::len));
    }
    Ok(())
}

async fn handle_urls(
    client: &Client,
    workspace: String,
    collection: String,
    rows: Vec<usize>,
    source: Option<String>,
    signed: bool,
    expiry_days: u32,
) -> Result<(), Error> {
    let collection = find_collection(client, &workspace, &collection).await?;
    let options = if signed {
        UrlOptions::signed(expiry_days)
    } else {
        UrlOptions::default()
    };
    let urls = collection
        .get_image_urls(rows.clone(), source_ref(source), &options)
        .await?;
    for (row, url) in rows.iter().zip(urls) {
        println!("{}\t{}", row, url);
    }
    Ok(())
}

async fn handle_download(
    client: &Client,
    workspace: String,
    collection: String,
    rows: Vec<usize>,
    source: Option<String>,
    output: PathBuf,
) -> Result<(), Error> {
    let collection = find_collection(client, &workspace, &collection).await?;
    let requested = rows.len();

    let options = BatchOptions::new().with_progress(progress_bar("Downloading images"));
    let saved = collection
        .save_row_images(
            rows,
            source_ref(source),
            &output,
            &UrlOptions::default(),
            &options,
        )
        .await?;
    println!(
        "Saved {} of {} image(s) to {}",
        saved.len(),
        requested,
        output.display()
    );
    Ok(())
}

async fn handle_upload_images(
    client: &Client,
    workspace: String,
    collection: String,
    source: String,
    paths: Vec<PathBuf>,
    data: Option<PathBuf>,
    column: String,
) -> Result<(), Error> {
    let collection = find_collection(client, &workspace, &collection).await?;
    let data = match data {
        Some(path) => Some(parse_rows(&tokio::fs::read(&path).await?)?),
        None => None,
    };

    let mut uploadables = [UploadableSource::new(&source, &paths[..], &column)?];
    let options = BatchOptions::new().with_progress(progress_bar("Uploading images"));
    let summaries = collection
        .add_images(&mut uploadables, data, &options)
        .await?;

    for summary in summaries {
        println!(
            "Uploaded {} image(s) from index {}",
            summary.uploaded, summary.first_index
        );
        for path in summary.skipped {
            warn!("Skipped {}: not a supported image type", path.display());
        }
    }
    Ok(())
}

async fn handle_replace_data(
    client: &Client,
    workspace: String,
    collection: String,
    file: PathBuf,
    force: bool,
) -> Result<(), Error> {
    let collection = find_collection(client, &workspace, &collection).await?;
    collection.replace_data(file.as_path(), !force).await?;
    println!("Replaced the data of {}", collection.name());
    Ok(())
}

async fn handle_annotations(
    client: &Client,
    workspace: String,
    collection: String,
    source: Option<String>,
) -> Result<(), Error> {
    let collection = find_collection(client, &workspace, &collection).await?;
    let annotations = collection.get_annotations(source_ref(source)).await?;
    for annotation in annotations {
        println!(
            "[{}] image {} {} class {} by {}",
            annotation.id(),
            annotation.image_index(),
            annotation.kind(),
            annotation
                .class_id()
                .map_or_else(|| "-".to_string(), |id| id.to_string()),
            annotation.author().unwrap_or("-")
        );
    }
    Ok(())
}

async fn handle_delete_annotation(
    client: &Client,
    workspace: String,
    collection: String,
    annotation_id: String,
) -> Result<(), Error> {
    let collection = find_collection(client, &workspace, &collection).await?;
    collection.delete_annotation(&annotation_id).await?;
    println!("Deleted annotation {}", annotation_id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let client = Client::new()?;
    let client = match &args.home {
        Some(home) => client.with_home(home)?,
        None => client,
    };

    // Login prompts for credentials itself.
    if args.cmd == Command::Login {
        return handle_login(client, args.username, args.password).await;
    }

    let client = match (&args.username, &args.password) {
        (Some(username), Some(password)) => client.with_login(username, password).await?,
        _ => match &args.token {
            Some(token) => client.with_token(token),
            None => client,
        },
    };

    match args.cmd {
        Command::Login => Ok(()),
        Command::Logout => handle_logout(&client).await,
        Command::Token => handle_token(&client).await,
        Command::Workspaces => handle_workspaces(&client).await,
        Command::Collections { workspace, name } => {
            handle_collections(&client, workspace, name).await
        }
        Command::Sources {
            workspace,
            collection,
        } => handle_sources(&client, workspace, collection).await,
        Command::Rows {
            workspace,
            collection,
            filters,
            tags,
        } => handle_rows(&client, workspace, collection, filters, tags).await,
        Command::Tags {
            workspace,
            collection,
        } => handle_tags(&client, workspace, collection).await,
        Command::Urls {
            workspace,
            collection,
            rows,
            source,
            signed,
            expiry_days,
        } => {
            handle_urls(&client, workspace, collection, rows, source, signed, expiry_days).await
        }
        Command::Download {
            workspace,
            collection,
            rows,
            source,
            output,
        } => {
            let output = output.unwrap_or_else(|| ".".into());
            handle_download(&client, workspace, collection, rows, source, output).await
        }
        Command::UploadImages {
            workspace,
            collection,
            source,
            paths,
            data,
            column,
        } => {
            handle_upload_images(&client, workspace, collection, source, paths, data, column).await
        }
        Command::ReplaceData {
            workspace,
            collection,
            file,
            force,
        } => handle_replace_data(&client, workspace, collection, file, force).await,
        Command::Annotations {
            workspace,
            collection,
            source,
        } => handle_annotations(&client, workspace, collection, source).await,
        Command::DeleteAnnotation {
            workspace,
            collection,
            annotation_id,
        } => handle_delete_annotation(&client, workspace, collection, annotation_id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        let (column, values) = parse_filter("breed=Cairn,3,true").unwrap();
        assert_eq!(column, "breed");
        assert_eq!(
            values,
            vec![
                FilterValue::Str("Cairn".to_string()),
                FilterValue::Int(3),
                FilterValue::Bool(true)
            ]
        );
        assert!(parse_filter("breed").is_err());
        assert!(parse_filter("=Cairn").is_err());

        let (_, values) = parse_filter("code='007',7").unwrap();
        assert_eq!(
            values,
            vec![FilterValue::Str("007".to_string()), FilterValue::Int(7)]
        );
    }

    #[test]
    fn test_source_ref_defaults_to_first() {
        assert_eq!(source_ref(None), SourceRef::Index(0));
        assert_eq!(source_ref(Some("B".to_string())), SourceRef::Name("B".to_string()));
    }
}
