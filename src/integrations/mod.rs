pub mod todoist;
