use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{FixedOffset, Offset, Utc};
use once_cell::sync::Lazy;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub gemini_api_keys: Vec<String>,
    pub gemini_model: String,
    pub gemini_alt_model: String,
    pub gemini_image_model: String,
    pub streaming_update_interval: Duration,
    pub telegram_max_length: usize,
    pub history_window: usize,
    pub user_chats_file: PathBuf,
    pub reset_utc_offset_minutes: i32,
    pub gemini_request_timeout: Duration,
    pub gemini_stream_idle_timeout: Duration,
    pub max_attachment_bytes: u64,
    pub system_prompt: String,
    pub image_processing_prompt: String,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
        .unwrap_or(default)
}

fn env_csv(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn read_prompt_file(path: &Path, fallback: &str) -> String {
    match fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => {
            info!("Loaded prompt from {}", path.display());
            content.trim().to_string()
        }
        Ok(_) => {
            warn!("Prompt file {} is empty; using built-in prompt", path.display());
            fallback.to_string()
        }
        Err(err) => {
            info!(
                "Prompt file {} not readable ({}); using built-in prompt",
                path.display(),
                err
            );
            fallback.to_string()
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("BOT_TOKEN is required"));
        }

        let mut gemini_api_keys = env_csv("GEMINI_API_KEYS");
        if gemini_api_keys.is_empty() {
            gemini_api_keys = env_csv("GEMINI_API_KEY");
        }
        if gemini_api_keys.is_empty() {
            return Err(anyhow::anyhow!(
                "GEMINI_API_KEYS (or GEMINI_API_KEY) must list at least one key"
            ));
        }

        let system_prompt = read_prompt_file(
            Path::new(&env_string("SYSTEM_PROMPT_PATH", "default_prompt.txt")),
            DEFAULT_SYSTEM_PROMPT,
        );
        let image_prompt = read_prompt_file(
            Path::new(&env_string(
                "IMAGE_PROMPT_PATH",
                "default_image_processing_prompt.txt",
            )),
            DEFAULT_IMAGE_PROMPT,
        );
        let image_processing_prompt = format!("{system_prompt}\n\n{image_prompt}");

        Ok(Config {
            bot_token,
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            gemini_api_keys,
            gemini_model: env_string("GEMINI_MODEL", "gemini-2.5-flash"),
            gemini_alt_model: env_string("GEMINI_ALT_MODEL", "gemini-2.0-flash-thinking-exp"),
            gemini_image_model: env_string(
                "GEMINI_IMAGE_MODEL",
                "gemini-2.0-flash-preview-image-generation",
            ),
            streaming_update_interval: Duration::from_millis(env_u64(
                "STREAMING_UPDATE_INTERVAL_MS",
                800,
            )),
            telegram_max_length: env_usize("TELEGRAM_MAX_LENGTH", 4000).max(1),
            history_window: env_usize("HISTORY_WINDOW", 1000).max(2),
            user_chats_file: PathBuf::from(env_string(
                "USER_CHATS_FILE",
                "user_chats_history.json",
            )),
            reset_utc_offset_minutes: env_i32("RESET_UTC_OFFSET_MINUTES", 210),
            gemini_request_timeout: Duration::from_secs(env_u64(
                "GEMINI_REQUEST_TIMEOUT_SECS",
                90,
            )),
            gemini_stream_idle_timeout: Duration::from_secs(env_u64(
                "GEMINI_STREAM_IDLE_TIMEOUT_SECS",
                60,
            )),
            max_attachment_bytes: env_u64("MAX_ATTACHMENT_BYTES", 20 * 1024 * 1024),
            system_prompt,
            image_processing_prompt,
        })
    }

    /// Offset used for the daily counter reset and the date line of the system prompt.
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.reset_utc_offset_minutes * 60).unwrap_or_else(|| {
            warn!(
                "RESET_UTC_OFFSET_MINUTES={} is out of range; using UTC",
                self.reset_utc_offset_minutes
            );
            Utc.fix()
        })
    }

    pub fn model_for(&self, preference: ModelPreference) -> &str {
        match preference {
            ModelPreference::Primary => &self.gemini_model,
            ModelPreference::Alternate => &self.gemini_alt_model,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelPreference {
    #[default]
    Primary,
    Alternate,
}

impl ModelPreference {
    pub fn toggled(self) -> Self {
        match self {
            ModelPreference::Primary => ModelPreference::Alternate,
            ModelPreference::Alternate => ModelPreference::Primary,
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly, knowledgeable assistant chatting with users on Telegram. Answer in the language the user writes in (usually Persian). Be concise, accurate and helpful, and use Markdown formatting where it improves readability.";

pub const DEFAULT_IMAGE_PROMPT: &str = "Describe this image in detail. If it contains text, a question or a problem, read it carefully and answer or solve it.";

pub const TIME_PROMPT_TEMPLATE: &str = "**اطلاعات مربوط به تاریخ و زمان:**\nتاریخ به میلادی: {date}  /// زمان: {time}\nاین اطلاعات رو داشته باش تا درصورتی که کاربر ازت پرسیدشون جواب بدی.";

pub const REPLY_CONTEXT_TEMPLATE: &str = "از این پیام به عنوان کانتکست برای پاسخ به درخواست جدید استفاده کن:\n--- شروع کانتکست ---\n({sender}): '{text}'\n--- پایان کانتکست ---\n\nدرخواست جدید کاربر: ";

pub const VOICE_PROMPT: &str = "این پیام صوتی کاربر است. ابتدا متن آن را دقیقاً بنویس و سپس به آن پاسخ بده.";

pub const FILE_PROMPT: &str = "این فایل را بررسی و خلاصه کن.";

/// User-facing strings.
pub mod messages {
    pub const ERROR_INFO: &str = "⚠️⚠️⚠️\nمشکلی پیش آمد!\nلطفاً درخواست خود را دوباره امتحان کنید و یا با ادمین ارتباط بگیرید!";
    pub const ERROR_DETAILS: &str = "جزئیات خطا:";
    pub const BEFORE_GENERATE: &str = "در حال نوشتن پاسخ ...✍️";
    pub const TYPING_SUFFIX: &str = " ✍️";
    pub const NO_RESPONSE: &str = "متاسفانه پاسخی از مدل دریافت نشد. لطفا دوباره تلاش کنید.";
    pub const WELCOME: &str = "\nمیتونی از دستور های ربات استفاده کنی و یا پیام خودت رو بفرستی.\nدر صورت نیاز /help را بزن.";
    pub const HISTORY_CLEARED: &str = "تاریخچه شما پاک شد.";
    pub const NOTHING_TO_CLEAR: &str = "تاریخچه‌ای برای پاک کردن وجود نداشت.";
    pub const SWITCH_ONLY_PRIVATE: &str = "این دستور فقط در چت خصوصی قابل استفاده است!";
    pub const SWITCHED_MODEL: &str = "اکنون از مدل {} استفاده می‌کنید.";
    pub const PHOTO_EDIT_PROMPT: &str = "لطفا یک عکس همراه با دستور ارسال کنید یا روی یک عکس ریپلای کنید و دستور /edit را بنویسید.";
    pub const EDIT_PROMPT_NEEDED: &str = "لطفاً توضیح ویرایش را بعد از دستور /edit بنویسید.\nبرای مثال: `/edit پس‌زمینه را آبی کن`";
    pub const ADD_PROMPT_IMG: &str = "لطفاً چیزی که می‌خواهید ترسیم شود را بعد از دستور /img بنویسید.\nبرای مثال: `/img یک گربه پشمالو برای من بکش.`";
    pub const DRAWING_IN_PROGRESS: &str = "در حال ساخت تصویر شما ...";
    pub const EDITING_IN_PROGRESS: &str = "در حال پردازش تصویر با دستور شما... 🖼️";
    pub const PHOTO_PROCESSING: &str = "درحال پردازش عکس شما ... 🧐";
    pub const VOICE_PROCESSING: &str = "در حال گوش دادن به پیام صوتی شما ... 🎧";
    pub const FILE_PROCESSING: &str = "در حال بررسی فایل شما ... 📄";
    pub const PHOTO_COMMAND_CAPTION_INFO: &str = "برای ویرایش عکس، روی آن ریپلای کرده و از دستور `/edit <توضیح ویرایش>` استفاده کنید.\nبرای تولید تصویر جدید از متن، از دستور `/img <توضیح تصویر>` استفاده کنید.";
    pub const GROUP_PROMPT_NEEDED: &str = "لطفاً پس از نقطه `.`، دستور یا سوال خود را بنویسید. مثال: `.سلام، خوبی؟`";
    pub const VOICE_ONLY_PRIMARY: &str = "پردازش صدا فقط با مدل {} امکان‌پذیر است. لطفا با دستور /switch مدل خود را تغییر دهید.";
    pub const ATTACHMENT_TOO_LARGE: &str = "حجم فایل بیش از حد مجاز است ({size} مگابایت، حداکثر {limit} مگابایت).";
    pub const ATTACHMENT_UNSUPPORTED: &str = "این نوع فایل پشتیبانی نمی‌شود: {mime}";
    pub const ATTACHMENT_DOWNLOAD_FAILED: &str = "خطا در دانلود فایل:";
    pub const IMAGE_RESULT_CAPTION: &str = "نتیجه ویرایش تصویر:";
    pub const IMAGE_GENERATED_CAPTION: &str = "تصویر تولید شده برای:";
    pub const IMAGE_TEXT_ONLY: &str = "مدل تصویری تولید نکرد، اما این پیام را ارسال کرد:";
    pub const IMAGE_NOTHING: &str = "تصویری تولید نشد و پاسخی از مدل دریافت نگردید.";
    pub const USER_SENDER: &str = "کاربر";
    pub const BOT_SENDER: &str = "دستیار AI";
    pub const FALLBACK_NAME: &str = "کاربر";
}
