use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    submit_campaign, CampaignOutbox, ContactDirectory, ContactsQuery, CrmClient, HistoryQuery,
    RecipientSelection, SelectionEvent, Session, DEFAULT_SEND_BATCH_SIZE,
};
use shared::{
    domain::{CampaignId, ContactId, TemplateId},
    protocol::{
        AwsSettings, BulkSendRequest, CampaignDraft, Contact, ContactDraft, SingleSendRequest,
        TemplateDraft,
    },
};
use tracing::info;

mod config;

#[derive(Parser, Debug)]
#[command(name = "crm-console", about = "Console for the email-marketing CRM backend")]
struct Cli {
    /// API base url; overrides console.toml and CRM_API_URL.
    #[arg(long)]
    api_url: Option<String>,
    /// Bearer token; overrides the stored one.
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and store the issued token in the config file.
    Login { email: String, password: String },
    /// Show the profile behind the current token.
    Whoami,
    Contacts {
        #[command(subcommand)]
        command: ContactsCommand,
    },
    Templates {
        #[command(subcommand)]
        command: TemplatesCommand,
    },
    Campaigns {
        #[command(subcommand)]
        command: CampaignsCommand,
    },
    /// Send one email to one address.
    SendSingle {
        to: String,
        subject: String,
        html_file: PathBuf,
    },
    /// Compose and send a bulk email to a recipient selection.
    SendBulk {
        subject: String,
        html_file: PathBuf,
        /// Restrict the selection to contacts matching this query.
        #[arg(long)]
        search: Option<String>,
        /// Select every contact matching the query, across all pages.
        #[arg(long)]
        all: bool,
        /// Explicit contact ids to select.
        #[arg(long = "to")]
        to: Vec<String>,
        #[arg(long, default_value_t = DEFAULT_SEND_BATCH_SIZE)]
        batch_size: u32,
    },
    /// Delivery history.
    History {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        status: Option<String>,
        #[arg(long = "type")]
        kind: Option<String>,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Send a test email to the configured sender address.
    TestEmail,
}

#[derive(Subcommand, Debug)]
enum ContactsCommand {
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long)]
        search: Option<String>,
    },
    Add {
        company: String,
        name: String,
        email: String,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        city: Option<String>,
    },
    Rm {
        id: String,
    },
    /// Import contacts from a CSV file.
    Import {
        file: PathBuf,
    },
    /// Contacts who opted out.
    Unsubscribed {
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
}

#[derive(Subcommand, Debug)]
enum TemplatesCommand {
    List,
    Add {
        name: String,
        subject: String,
        body_file: PathBuf,
    },
    Rm {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum CampaignsCommand {
    List,
    Create {
        name: String,
        subject: String,
        html_file: PathBuf,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long = "to")]
        to: Vec<String>,
    },
    Send {
        id: String,
    },
    Rm {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    Show,
    /// Ask the backend to verify the stored SES credentials.
    Verify,
    Update {
        access_key_id: String,
        secret_access_key: String,
        region: String,
        from_email: String,
        from_name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = config::load_settings();

    let api_url = cli.api_url.unwrap_or_else(|| settings.api_url.clone());
    let session = match cli.token.or_else(|| settings.token.clone()) {
        Some(token) => Session::with_token(token),
        None => Session::anonymous(),
    };
    let client = Arc::new(CrmClient::new(&api_url, session)?);

    match cli.command {
        Command::Login { email, password } => {
            let response = client.login(&email, &password).await?;
            config::save_token(&response.token)?;
            println!("logged in as {}", response.user.email);
        }
        Command::Whoami => {
            let user = client.current_user().await?;
            println!("{} ({})", user.email, user.id);
        }
        Command::Contacts { command } => run_contacts(&client, settings.page_size, command).await?,
        Command::Templates { command } => run_templates(&client, command).await?,
        Command::Campaigns { command } => {
            run_campaigns(&client, settings.page_size, command).await?
        }
        Command::SendSingle {
            to,
            subject,
            html_file,
        } => {
            let html = read_text(&html_file)?;
            client
                .send_single(&SingleSendRequest { to: to.clone(), subject, html })
                .await?;
            println!("sent to {to}");
        }
        Command::SendBulk {
            subject,
            html_file,
            search,
            all,
            to,
            batch_size,
        } => {
            let html = read_text(&html_file)?;
            let recipients = resolve_recipients(&client, settings.page_size, search, all, to).await?;
            let outcome = client
                .send_bulk(BulkSendRequest {
                    recipients: recipients.iter().map(|c| c.email.clone()).collect(),
                    subject,
                    html,
                    batch_size: Some(batch_size),
                })
                .await?;
            println!(
                "bulk send finished: {} successful, {} failed",
                outcome.successful.len(),
                outcome.failed.len()
            );
        }
        Command::History { page, status, kind } => {
            let history = client
                .email_history(&HistoryQuery {
                    page: Some(page),
                    limit: Some(settings.page_size),
                    status,
                    kind,
                })
                .await?;
            for entry in &history.emails {
                println!(
                    "{}  {:?}/{:?}  {}  {}",
                    entry.created_at, entry.status, entry.kind, entry.to, entry.subject
                );
            }
            println!(
                "page {} of {} ({} emails)",
                history.pagination.current_page,
                history.pagination.total_pages,
                history.pagination.total_items
            );
        }
        Command::Settings { command } => run_settings(&client, command).await?,
        Command::TestEmail => {
            client.send_test().await?;
            println!("test email queued");
        }
    }

    Ok(())
}

async fn run_contacts(
    client: &Arc<CrmClient>,
    page_size: u32,
    command: ContactsCommand,
) -> Result<()> {
    match command {
        ContactsCommand::List { page, search } => {
            let listing = client
                .list_contacts(&ContactsQuery {
                    page: Some(page),
                    limit: Some(page_size),
                    search,
                    status: None,
                })
                .await?;
            for contact in &listing.items {
                print_contact(contact);
            }
            println!(
                "page {} of {} ({} contacts)",
                listing.pagination.page,
                listing.pagination.total_pages,
                listing.pagination.total_items
            );
        }
        ContactsCommand::Add {
            company,
            name,
            email,
            role,
            city,
        } => {
            let contact = client
                .create_contact(&ContactDraft {
                    company,
                    full_name: name,
                    email,
                    role,
                    city,
                    ..ContactDraft::default()
                })
                .await?;
            println!("created {}", contact.id);
        }
        ContactsCommand::Rm { id } => {
            client.delete_contact(&ContactId::from(id)).await?;
            println!("deleted");
        }
        ContactsCommand::Import { file } => {
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("contacts.csv")
                .to_owned();
            let bytes = std::fs::read(&file)
                .with_context(|| format!("read csv '{}'", file.display()))?;
            let report = client.import_contacts_csv(&filename, bytes).await?;
            println!("imported {} contacts, skipped {}", report.imported, report.skipped);
            for error in &report.errors {
                println!("  {error}");
            }
        }
        ContactsCommand::Unsubscribed { page } => {
            let listing = client
                .list_unsubscribers(&ContactsQuery {
                    page: Some(page),
                    limit: Some(page_size),
                    search: None,
                    status: None,
                })
                .await?;
            for contact in &listing.items {
                print_contact(contact);
            }
            println!("{} unsubscribed", listing.pagination.total_items);
        }
    }
    Ok(())
}

async fn run_templates(client: &Arc<CrmClient>, command: TemplatesCommand) -> Result<()> {
    match command {
        TemplatesCommand::List => {
            for template in client.list_templates().await? {
                println!("{}  {}  {}", template.id, template.name, template.subject);
            }
        }
        TemplatesCommand::Add {
            name,
            subject,
            body_file,
        } => {
            let body = read_text(&body_file)?;
            let template = client
                .create_template(&TemplateDraft { name, subject, body })
                .await?;
            println!("created {}", template.id);
        }
        TemplatesCommand::Rm { id } => {
            client.delete_template(&TemplateId::from(id)).await?;
            println!("deleted");
        }
    }
    Ok(())
}

async fn run_campaigns(
    client: &Arc<CrmClient>,
    page_size: u32,
    command: CampaignsCommand,
) -> Result<()> {
    match command {
        CampaignsCommand::List => {
            for campaign in client.list_campaigns().await? {
                println!(
                    "{}  {:?}  {}  ({} recipients)",
                    campaign.id,
                    campaign.status,
                    campaign.name,
                    campaign.contacts.len()
                );
            }
        }
        CampaignsCommand::Create {
            name,
            subject,
            html_file,
            search,
            all,
            to,
        } => {
            let html = read_text(&html_file)?;
            let recipients = resolve_recipients(client, page_size, search, all, to).await?;
            let draft = CampaignDraft {
                name,
                subject,
                html,
                contact_ids: recipients.into_iter().map(|c| c.id).collect(),
                scheduled_at: None,
                batch_size: None,
            };
            let campaign = submit_campaign(client.as_ref(), draft).await?;
            println!("created campaign {} ({:?})", campaign.id, campaign.status);
        }
        CampaignsCommand::Send { id } => {
            client.send_campaign(&CampaignId::from(id)).await?;
            println!("send started");
        }
        CampaignsCommand::Rm { id } => {
            client.delete_campaign(&CampaignId::from(id)).await?;
            println!("deleted");
        }
    }
    Ok(())
}

async fn run_settings(client: &Arc<CrmClient>, command: SettingsCommand) -> Result<()> {
    match command {
        SettingsCommand::Show => {
            let settings = client.aws_settings().await?;
            println!("region:     {}", settings.region);
            println!("from email: {}", settings.from_email);
            println!("from name:  {}", settings.from_name);
            println!("access key: {}", settings.access_key_id);
        }
        SettingsCommand::Verify => {
            let outcome = client.verify_aws_settings().await?;
            match (outcome.verified, outcome.message) {
                (true, _) => println!("SES credentials verified"),
                (false, Some(message)) => println!("verification failed: {message}"),
                (false, None) => println!("verification failed"),
            }
        }
        SettingsCommand::Update {
            access_key_id,
            secret_access_key,
            region,
            from_email,
            from_name,
        } => {
            client
                .update_aws_settings(&AwsSettings {
                    access_key_id,
                    secret_access_key,
                    region,
                    from_email,
                    from_name,
                })
                .await?;
            println!("settings updated");
        }
    }
    Ok(())
}

/// Drives the recipient reconciler for the compose flows: either an
/// exhaustive select-all over the query or an explicit id list.
async fn resolve_recipients(
    client: &Arc<CrmClient>,
    page_size: u32,
    search: Option<String>,
    all: bool,
    to: Vec<String>,
) -> Result<Vec<Contact>> {
    let directory: Arc<dyn ContactDirectory> = client.clone();
    let selection = RecipientSelection::with_page_size(directory, page_size);

    if all {
        if let Some(query) = search {
            selection.search(query).await?;
        }
        let mut events = selection.subscribe_events();
        let progress = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let SelectionEvent::FetchAllProgress { fetched, total } = event {
                    info!(fetched, total, "gathering recipients");
                }
            }
        });
        let applied = selection.select_all_matching(true).await?;
        progress.abort();
        if !applied {
            bail!("recipient selection was cancelled");
        }
    } else {
        if to.is_empty() {
            bail!("no recipients: pass --to <contact-id> (repeatable) or --all");
        }
        for id in to {
            selection.toggle(ContactId::from(id), true).await;
        }
    }

    let recipients = selection.recipients().await?;
    if recipients.is_empty() {
        bail!("selection resolved to zero deliverable recipients");
    }
    Ok(recipients)
}

fn print_contact(contact: &Contact) {
    let marker = if contact.unsubscribed { " [unsub]" } else { "" };
    println!(
        "{}  {}  <{}>  {}{marker}",
        contact.id, contact.full_name, contact.email, contact.company
    );
}

fn read_text(path: &PathBuf) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("read file '{}'", path.display()))
}
